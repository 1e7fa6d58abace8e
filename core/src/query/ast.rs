//! Statement AST for the query sub-language.

use common::point::Tags;
use common::time::UnixNano;

use crate::catalog::Privilege;

/// A measurement reference of one to three identifier segments:
/// `measurement`, `policy.measurement` or `database.policy.measurement`.
/// The dispatcher normalizes every reference to all three segments
/// before planning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MeasurementName {
    pub database: Option<String>,
    pub policy: Option<String>,
    pub name: String,
}

impl MeasurementName {
    pub fn bare(name: &str) -> MeasurementName {
        MeasurementName {
            database: None,
            policy: None,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    First,
    Last,
}

impl Aggregate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregate::Count => "count",
            Aggregate::Sum => "sum",
            Aggregate::Mean => "mean",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
            Aggregate::First => "first",
            Aggregate::Last => "last",
        }
    }
}

/// One projected column of a SELECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectField {
    Wildcard,
    Field {
        function: Option<Aggregate>,
        name: String,
        alias: Option<String>,
    },
}

impl SelectField {
    /// The result column name: alias, the function name for aggregates,
    /// else the field name.
    pub fn column_name(&self) -> String {
        match self {
            SelectField::Wildcard => "*".to_string(),
            SelectField::Field {
                alias: Some(alias), ..
            } => alias.clone(),
            SelectField::Field {
                function: Some(f), ..
            } => f.as_str().to_string(),
            SelectField::Field { name, .. } => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStatement {
    pub fields: Vec<SelectField>,
    /// INTO target segments (empty when absent); used by continuous
    /// queries.
    pub into: Vec<String>,
    pub source: MeasurementName,
    /// Conjunction of `tag = 'value'` conditions.
    pub tag_filter: Tags,
    /// Half-open time range `[start, end)`; either bound may be absent.
    pub time_start: Option<UnixNano>,
    pub time_end: Option<UnixNano>,
    /// GROUP BY time(interval), in nanoseconds.
    pub group_by_interval: Option<i64>,
    /// GROUP BY tag keys.
    pub group_by_tags: Vec<String>,
}

impl SelectStatement {
    /// True if every projected field is an aggregate call.
    pub fn is_aggregated(&self) -> bool {
        !self.fields.is_empty()
            && self.fields.iter().all(|f| {
                matches!(
                    f,
                    SelectField::Field {
                        function: Some(_),
                        ..
                    }
                )
            })
    }

    /// Overwrites the statement's time range, used when a continuous
    /// query recomputes a window.
    pub fn set_time_range(&mut self, start: UnixNano, end: UnixNano) {
        self.time_start = Some(start);
        self.time_end = Some(end);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateContinuousQueryStatement {
    pub name: String,
    pub database: String,
    pub select: SelectStatement,
    /// The statement's original text, republished verbatim when the
    /// continuous query is created cluster-wide.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),

    CreateDatabase {
        name: String,
    },
    DropDatabase {
        name: String,
    },
    ShowDatabases,

    CreateRetentionPolicy {
        database: String,
        name: String,
        duration: i64,
        replica_n: u32,
        default: bool,
    },
    AlterRetentionPolicy {
        database: String,
        name: String,
        duration: Option<i64>,
        replica_n: Option<u32>,
        default: bool,
    },
    DropRetentionPolicy {
        database: String,
        name: String,
    },
    ShowRetentionPolicies {
        database: String,
    },

    CreateUser {
        name: String,
        password: String,
        admin: bool,
    },
    DropUser {
        name: String,
    },
    ShowUsers,

    Grant {
        privilege: Privilege,
        database: Option<String>,
        user: String,
    },
    Revoke {
        privilege: Privilege,
        database: Option<String>,
        user: String,
    },

    ShowMeasurements,
    ShowSeries {
        source: Option<MeasurementName>,
    },
    ShowTagKeys {
        source: Option<MeasurementName>,
    },
    ShowTagValues {
        source: Option<MeasurementName>,
        key: String,
    },
    ShowFieldKeys {
        source: Option<MeasurementName>,
    },
    ShowContinuousQueries,

    CreateContinuousQuery(CreateContinuousQueryStatement),
}

impl Statement {
    /// The privileges a user must hold to execute this statement, as
    /// `(database, privilege)` pairs. `None` for the database means the
    /// request's fallback database; an empty database name requires
    /// cluster admin.
    pub fn required_privileges(&self) -> Vec<(Option<String>, Privilege)> {
        use Statement::*;
        match self {
            Select(select) => vec![(select.source.database.clone(), Privilege::Read)],
            ShowMeasurements
            | ShowSeries { .. }
            | ShowTagKeys { .. }
            | ShowTagValues { .. }
            | ShowFieldKeys { .. }
            | ShowContinuousQueries => vec![(None, Privilege::Read)],
            CreateContinuousQuery(cq) => vec![(Some(cq.database.clone()), Privilege::All)],
            // Everything else manipulates cluster-wide state.
            _ => vec![(Some(String::new()), Privilege::All)],
        }
    }

    /// Short description used in authorization errors.
    pub fn kind(&self) -> &'static str {
        use Statement::*;
        match self {
            Select(_) => "select",
            CreateDatabase { .. } => "create database",
            DropDatabase { .. } => "drop database",
            ShowDatabases => "show databases",
            CreateRetentionPolicy { .. } => "create retention policy",
            AlterRetentionPolicy { .. } => "alter retention policy",
            DropRetentionPolicy { .. } => "drop retention policy",
            ShowRetentionPolicies { .. } => "show retention policies",
            CreateUser { .. } => "create user",
            DropUser { .. } => "drop user",
            ShowUsers => "show users",
            Grant { .. } => "grant",
            Revoke { .. } => "revoke",
            ShowMeasurements => "show measurements",
            ShowSeries { .. } => "show series",
            ShowTagKeys { .. } => "show tag keys",
            ShowTagValues { .. } => "show tag values",
            ShowFieldKeys { .. } => "show field keys",
            ShowContinuousQueries => "show continuous queries",
            CreateContinuousQuery(_) => "create continuous query",
        }
    }
}
