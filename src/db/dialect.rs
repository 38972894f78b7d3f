use std::fmt;
use std::str::FromStr;

use super::StoreError;

/// The database engine a handle is bound to.
///
/// Set once when the store is opened; transactions inherit it. Every
/// query-rewriting and id-retrieval decision dispatches on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
        }
    }
}

impl FromStr for Dialect {
    type Err = StoreError;

    /// Parse a configured dialect name. An empty string selects sqlite so a
    /// bare config file works out of the box.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "sqlite" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            other => Err(StoreError::Config(format!("unsupported dialect {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names() {
        assert_eq!("sqlite".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert_eq!("".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert_eq!("postgres".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("PostgreSQL".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!(" sqlite ".parse::<Dialect>().unwrap(), Dialect::Sqlite);
    }

    #[test]
    fn rejects_unknown_names() {
        assert!("mysql".parse::<Dialect>().is_err());
        assert!("oracle".parse::<Dialect>().is_err());
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(Dialect::Sqlite.to_string(), "sqlite");
        assert_eq!(Dialect::Postgres.to_string(), "postgres");
    }
}
