use snafu::Snafu;

use crate::db::DbError;
use crate::sqltemplate::TemplateError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(context(false))]
    #[snafu(display("database error: {}", source))]
    Db { source: DbError },

    #[snafu(context(false))]
    #[snafu(display("template error: {}", source))]
    Template { source: TemplateError },

    #[snafu(context(false))]
    #[snafu(display("{}", source))]
    Model { source: models::ModelError },

    #[snafu(display("invalid configuration: {}", reason))]
    Config { reason: String },

    #[snafu(display(
        "table '{}' is missing required column '{}' and nothing can create it",
        table,
        column
    ))]
    UnresolvableColumn { table: String, column: String },

    #[snafu(display("writing tag table '{}': {}", table, reason))]
    TagTable { table: String, reason: String },

    #[snafu(display("internal error: {}", reason))]
    Internal { reason: String },
}

impl Error {
    /// Transient errors abort the write cycle unmodified so the caller's
    /// scheduling layer can retry the whole batch; everything else has
    /// already been narrowed to the offending column, field, or sub-batch.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Db { source } => source.is_transient(),
            _ => false,
        }
    }
}
