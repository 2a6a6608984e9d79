//! Agent core: operations, their parsing and execution, error diagnosis,
//! and the permission table.

pub mod approval;
pub mod diagnosis;
pub mod executor;
pub mod operation;
pub mod parser;

pub use approval::{PermissionRequest, PermissionStatus, PermissionTable};
pub use diagnosis::{ErrorAnalysis, ErrorCategory, classify};
pub use executor::{OperationExecutor, Requester};
pub use operation::{Operation, OperationRecord, OperationStatus};
pub use parser::{OperationParser, PatternParser};
