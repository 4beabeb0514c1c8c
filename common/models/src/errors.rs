use snafu::Snafu;

use crate::column::ColumnRole;

pub type ModelResult<T, E = ModelError> = std::result::Result<T, E>;

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum ModelError {
    #[snafu(display(
        "identifier '{}' is {} bytes, over the {}-byte limit",
        name,
        name.len(),
        crate::column::MAX_IDENTIFIER_BYTES
    ))]
    IdentifierTooLong { name: String },

    #[snafu(display("column '{}' has role {} and can never be dropped", name, role))]
    ColumnNotDroppable { name: String, role: ColumnRole },
}
