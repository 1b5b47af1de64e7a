use crate::forecast::{Forecast, RetrieverId, Serial};

/// Errors from dashboard bookkeeping.
///
/// None of these abort a packet: they are reported to the caller of the
/// offending operation only.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DashboardError {
    #[error("unknown retriever: {0}")]
    UnknownRetriever(RetrieverId),

    #[error("serial number {0} is not part of this packet")]
    UnknownSerial(Serial),

    /// A retriever tried to widen its forecast. The stored forecast was
    /// narrowed to the intersection of `current` and `requested`.
    #[error("{retriever} widened its forecast for serial {serial} from {current} to {requested}")]
    ForecastWidened {
        retriever: RetrieverId,
        serial: Serial,
        current: Forecast,
        requested: Forecast,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for dashboard operations.
pub type DashboardResult<T> = Result<T, DashboardError>;
