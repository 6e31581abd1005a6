use thiserror::Error;

use crate::model::ReservationKey;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger log error: {0}")]
    Wal(#[from] std::io::Error),

    #[error("ledger writer shut down")]
    WriterClosed,

    #[error("row for {} missing right after it was recorded", .0.reservation_id())]
    Vanished(ReservationKey),
}
