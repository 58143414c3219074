pub mod pnl;
pub mod price;
pub mod shares;
