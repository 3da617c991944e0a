use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    TomlParsing(toml::de::Error),
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TomlParsing(e) => write!(f, "failed to parse the config file: {e}"),
            Error::Io(e) => write!(f, "failed to read the config file: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::TomlParsing(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
