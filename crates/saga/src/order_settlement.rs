//! Order settlement saga constants.

/// The saga type identifier for order settlement.
pub const SAGA_TYPE: &str = "OrderSettlement";

/// Step name: Check the user and the item list.
pub const STEP_VALIDATE: &str = "validate";

/// Step name: Take stock for every item.
pub const STEP_RESERVE_STOCK: &str = "reserve_stock";

/// Step name: Capture names and prices of the reserved products.
pub const STEP_PRICE_LINES: &str = "price_lines";

/// Step name: Redeem the coupon and compute the discount.
pub const STEP_APPLY_COUPON: &str = "apply_coupon";

/// Step name: Debit the final amount from the wallet.
pub const STEP_DEBIT_WALLET: &str = "debit_wallet";

/// Step name: Persist the confirmed order.
pub const STEP_CONFIRM: &str = "confirm";
