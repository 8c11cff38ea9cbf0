use rust_decimal::Decimal;

/// Renders an amount the way `formatUnits` does: trailing zeros dropped, but always
/// at least one fractional digit (`3` renders as `3.0`).
pub fn format_amount(amount: Decimal) -> String {
    let normalized = amount.normalize();
    if normalized.scale() == 0 {
        format!("{normalized}.0")
    } else {
        normalized.to_string()
    }
}
