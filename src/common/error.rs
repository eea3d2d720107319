use std::{error::Error, fmt};

#[derive(Debug)]
pub enum TradewindError {
    Simple(String),
    Validation(String),
    Crypto(String),
    Wallet(String),
    Transport(String),
    Timeout(String),
    InvalidPhase(String),
    SerdesJson(serde_json::Error),
    Io(std::io::Error),
    StrumParsing(strum::ParseError),
    MpscSend(String),
    OneshotRecv(tokio::sync::oneshot::error::RecvError),
    TaskJoin(tokio::task::JoinError),
}

impl Error for TradewindError {}

impl fmt::Display for TradewindError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let error_string = match self {
            TradewindError::Simple(msg) => format!("Tradewind-Error | Other - {}", msg),
            TradewindError::Validation(msg) => {
                format!("Tradewind-Error | Validation - {}", msg)
            }
            TradewindError::Crypto(msg) => format!("Tradewind-Error | Crypto - {}", msg),
            TradewindError::Wallet(msg) => format!("Tradewind-Error | Wallet - {}", msg),
            TradewindError::Transport(msg) => {
                format!("Tradewind-Error | Transport - {}", msg)
            }
            TradewindError::Timeout(msg) => format!("Tradewind-Error | Timeout - {}", msg),
            TradewindError::InvalidPhase(msg) => {
                format!("Tradewind-Error | InvalidPhase - {}", msg)
            }
            TradewindError::SerdesJson(err) => {
                format!("Tradewind-Error | SerdesJsonError - {}", err)
            }
            TradewindError::Io(err) => format!("Tradewind-Error | IoError - {}", err),
            TradewindError::StrumParsing(err) => {
                format!("Tradewind-Error | StrumParseError - {}", err)
            }
            TradewindError::MpscSend(msg) => {
                format!("Tradewind-Error | MpscSendError - {}", msg)
            }
            TradewindError::OneshotRecv(err) => {
                format!("Tradewind-Error | OneshotRecvError - {}", err)
            }
            TradewindError::TaskJoin(err) => {
                format!("Tradewind-Error | TaskJoinError - {}", err)
            }
        };
        write!(f, "{}", error_string)
    }
}

impl From<serde_json::Error> for TradewindError {
    fn from(e: serde_json::Error) -> TradewindError {
        TradewindError::SerdesJson(e)
    }
}

impl From<std::io::Error> for TradewindError {
    fn from(e: std::io::Error) -> TradewindError {
        TradewindError::Io(e)
    }
}

impl From<strum::ParseError> for TradewindError {
    fn from(e: strum::ParseError) -> TradewindError {
        TradewindError::StrumParsing(e)
    }
}

impl From<secp256k1::Error> for TradewindError {
    fn from(e: secp256k1::Error) -> TradewindError {
        TradewindError::Crypto(e.to_string())
    }
}

impl From<getrandom::Error> for TradewindError {
    fn from(e: getrandom::Error) -> TradewindError {
        TradewindError::Crypto(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TradewindError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> TradewindError {
        TradewindError::MpscSend(e.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for TradewindError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> TradewindError {
        TradewindError::OneshotRecv(e)
    }
}

impl From<tokio::task::JoinError> for TradewindError {
    fn from(e: tokio::task::JoinError) -> TradewindError {
        TradewindError::TaskJoin(e)
    }
}
