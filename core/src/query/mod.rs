//! Query sub-language: statement AST, parser, and local execution.

pub mod ast;
pub mod exec;
pub mod parser;

pub use ast::{
    Aggregate, CreateContinuousQueryStatement, MeasurementName, SelectField, SelectStatement,
    Statement,
};
pub use exec::{Row, RowValue, SelectPlan, SeriesSource};
pub use parser::{parse_query, parse_statement, ParseError};
