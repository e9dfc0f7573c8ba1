//! The `result` module exposes a Result type that propagates one of many
//! different Error types.

use crate::{config::ConfigError, wire::CodecError};

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Json(serde_json::Error),
    AddrParse(std::net::AddrParseError),
    JoinError(Box<dyn std::any::Any + Send + 'static>),
    RecvError(crossbeam_channel::RecvError),
    RecvTimeoutError(crossbeam_channel::RecvTimeoutError),
    SendError,
    Codec(CodecError),
    Config(ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Json(e) => write!(f, "serialization error: {e}"),
            Error::AddrParse(e) => write!(f, "address parse error: {e}"),
            Error::JoinError(_) => write!(f, "thread join error"),
            Error::RecvError(e) => write!(f, "channel recv error: {e}"),
            Error::RecvTimeoutError(e) => write!(f, "channel recv error: {e}"),
            Error::SendError => write!(f, "channel send error"),
            Error::Codec(e) => write!(f, "codec error: {e}"),
            Error::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl std::convert::From<crossbeam_channel::RecvError> for Error {
    fn from(e: crossbeam_channel::RecvError) -> Error {
        Error::RecvError(e)
    }
}
impl std::convert::From<crossbeam_channel::RecvTimeoutError> for Error {
    fn from(e: crossbeam_channel::RecvTimeoutError) -> Error {
        Error::RecvTimeoutError(e)
    }
}
impl<T> std::convert::From<crossbeam_channel::SendError<T>> for Error {
    fn from(_e: crossbeam_channel::SendError<T>) -> Error {
        Error::SendError
    }
}
impl std::convert::From<Box<dyn std::any::Any + Send + 'static>> for Error {
    fn from(e: Box<dyn std::any::Any + Send + 'static>) -> Error {
        Error::JoinError(e)
    }
}
impl std::convert::From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}
impl std::convert::From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Json(e)
    }
}
impl std::convert::From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Error {
        Error::AddrParse(e)
    }
}
impl std::convert::From<CodecError> for Error {
    fn from(e: CodecError) -> Error {
        Error::Codec(e)
    }
}
impl std::convert::From<ConfigError> for Error {
    fn from(e: ConfigError) -> Error {
        Error::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{Error, Result},
        assert_matches::assert_matches,
        std::{io, net::SocketAddr, panic, thread},
    };

    fn addr_parse_error() -> Result<SocketAddr> {
        let r = "12fdfasfsafsadfs".parse()?;
        Ok(r)
    }

    fn join_error() -> Result<()> {
        panic::set_hook(Box::new(|_info| {}));
        thread::spawn(|| panic!("hi")).join()?;
        Ok(())
    }

    fn send_error() -> Result<()> {
        let (s, r) = crossbeam_channel::unbounded();
        drop(r);
        s.send(())?;
        Ok(())
    }

    #[test]
    fn from_test() {
        assert_matches!(addr_parse_error(), Err(Error::AddrParse(_)));
        assert_matches!(
            Error::from(crossbeam_channel::RecvError {}),
            Error::RecvError(_)
        );
        assert_matches!(send_error(), Err(Error::SendError));
        assert_matches!(join_error(), Err(Error::JoinError(_)));
        let ioe = io::Error::new(io::ErrorKind::NotFound, "hi");
        assert_matches!(Error::from(ioe), Error::Io(_));
    }

    #[test]
    fn fmt_test() {
        use std::io::Write;
        write!(io::sink(), "{}", Error::from(crossbeam_channel::RecvError {})).unwrap();
        write!(
            io::sink(),
            "{}",
            Error::from(io::Error::new(io::ErrorKind::NotFound, "hi"))
        )
        .unwrap();
    }
}
