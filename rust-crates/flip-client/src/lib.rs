pub mod address;

pub mod balance;

pub mod bet;

pub mod cell;

pub mod coins;

pub mod config;

pub mod reconciler;

pub mod rpc;

#[cfg(test)]
mod testing;

pub use address::{
    Address,
    AddressError,
    AddressStyle,
};
pub use cell::{
    Cell,
    CellBuilder,
    CellError,
    Slice,
};
pub use coins::Coins;
pub use rpc::{
    RpcClient,
    RpcError,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cell(#[from] CellError),
    #[error(transparent)]
    Boc(#[from] cell::boc::BocError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] balance::store::StoreError),
    #[error("configuration error: {0}")]
    Config(String),
}
