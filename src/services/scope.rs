use rust_decimal::Decimal;

use crate::models::{CampaignScope, CartLine};

/// Result of matching a campaign scope against a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeMatch {
    pub applies: bool,
    /// Sum of the line totals the campaign covers.
    pub eligible_subtotal: Decimal,
}

/// Line-level matching: a campaign may discount only some lines of a mixed cart.
pub fn match_scope(scope: &CampaignScope, cart: &[CartLine]) -> ScopeMatch {
    if scope.apply_to_all {
        return ScopeMatch {
            applies: true,
            eligible_subtotal: cart.iter().map(CartLine::line_total).sum(),
        };
    }

    let mut applies = false;
    let mut eligible_subtotal = Decimal::ZERO;
    for line in cart.iter().filter(|line| scope.covers(line)) {
        applies = true;
        eligible_subtotal += line.line_total();
    }

    ScopeMatch {
        applies,
        eligible_subtotal,
    }
}
