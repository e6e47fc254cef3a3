pub mod nowpayments;
pub mod solana_watcher;
