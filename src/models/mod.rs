pub mod shop;

pub use shop::{
    AdminLogEntry,
    ApiResponse,
    BasketItem,
    BasketQuote,
    DiscountCode,
    DiscountOutcome,
    PendingDeposit,
    Product,
    ProductMedia,
    ProductSelector,
    Purchase,
    ResellerRule,
    SnapshotItem,
    User,
};
