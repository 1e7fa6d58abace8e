//! nom parser for the query sub-language.

use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while, take_while1};
use nom::character::complete::{alpha1, char, digit1, multispace0, multispace1};
use nom::combinator::{all_consuming, map, opt, recognize, value};
use nom::error::{convert_error, VerboseError};
use nom::multi::separated_list1;
use nom::sequence::{delimited, pair, preceded, tuple};

use common::time;

use super::ast::*;
use crate::catalog::Privilege;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0}")]
    Message(String),
}

type IResult<'a, O> = nom::IResult<&'a str, O, VerboseError<&'a str>>;

/// Parses a semicolon-separated list of statements.
pub fn parse_query(input: &str) -> Result<Vec<Statement>, ParseError> {
    let mut statements = Vec::new();
    for part in split_statements(input) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        statements.push(parse_statement(trimmed)?);
    }
    Ok(statements)
}

/// Parses exactly one statement.
pub fn parse_statement(input: &str) -> Result<Statement, ParseError> {
    match all_consuming(ws(statement))(input) {
        Ok((_, mut stmt)) => {
            if let Statement::CreateContinuousQuery(cq) = &mut stmt {
                cq.text = input.trim().to_string();
            }
            Ok(stmt)
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(ParseError::Message(convert_error(input, e)))
        }
        Err(nom::Err::Incomplete(_)) => Err(ParseError::Message("incomplete input".to_string())),
    }
}

/// Splits on semicolons outside of single-quoted strings and outside a
/// BEGIN ... END block, so continuous-query bodies stay intact.
fn split_statements(input: &str) -> Vec<&str> {
    let bytes = input.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut in_string = false;
    let mut depth = 0usize;

    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b';' if !in_string && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ if !in_string => {
                if keyword_at(bytes, i, b"BEGIN") {
                    depth += 1;
                } else if keyword_at(bytes, i, b"END") && depth > 0 {
                    depth -= 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&input[start..]);
    parts
}

fn keyword_at(bytes: &[u8], at: usize, word: &[u8]) -> bool {
    if at + word.len() > bytes.len() {
        return false;
    }
    if !bytes[at..at + word.len()].eq_ignore_ascii_case(word) {
        return false;
    }
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let before_ok = at == 0 || !is_word(bytes[at - 1]);
    let after_ok = at + word.len() == bytes.len() || !is_word(bytes[at + word.len()]);
    before_ok && after_ok
}

fn ws<'a, F, O>(mut inner: F) -> impl FnMut(&'a str) -> IResult<'a, O>
where
    F: FnMut(&'a str) -> IResult<'a, O>,
{
    move |input| {
        let (input, _) = multispace0(input)?;
        let (input, out) = inner(input)?;
        let (input, _) = multispace0(input)?;
        Ok((input, out))
    }
}

fn bare_identifier(input: &str) -> IResult<&str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        take_while(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
    ))(input)
}

fn quoted_identifier(input: &str) -> IResult<String> {
    map(
        delimited(char('"'), take_while1(|c| c != '"'), char('"')),
        |s: &str| s.to_string(),
    )(input)
}

fn identifier(input: &str) -> IResult<String> {
    alt((quoted_identifier, map(bare_identifier, |s| s.to_string())))(input)
}

fn string_literal(input: &str) -> IResult<String> {
    map(
        delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        |s: &str| s.to_string(),
    )(input)
}

fn integer_literal(input: &str) -> IResult<i64> {
    let (rest, raw) = recognize(pair(opt(char('-')), digit1))(input)?;
    match raw.parse::<i64>() {
        Ok(v) => Ok((rest, v)),
        Err(_) => Err(nom::Err::Error(VerboseError { errors: vec![] })),
    }
}

/// Duration literal such as `10s`, `90m`, `1h`, `7d`.
fn duration_literal(input: &str) -> IResult<i64> {
    let (rest, (raw, unit)) = pair(
        digit1,
        alt((
            tag("ns"),
            tag("ms"),
            tag("us"),
            tag("w"),
            tag("d"),
            tag("h"),
            tag("m"),
            tag("s"),
        )),
    )(input)?;
    let n: i64 = match raw.parse() {
        Ok(v) => v,
        Err(_) => return Err(nom::Err::Error(VerboseError { errors: vec![] })),
    };
    let scale = match unit {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => time::NANOS_PER_SECOND,
        "m" => time::NANOS_PER_MINUTE,
        "h" => time::NANOS_PER_HOUR,
        "d" => time::NANOS_PER_DAY,
        "w" => 7 * time::NANOS_PER_DAY,
        _ => unreachable!(),
    };
    Ok((rest, n * scale))
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<'a, &'a str> {
    move |input| {
        let (rest, matched) = tag_no_case(word)(input)?;
        // Reject keyword prefixes of longer identifiers.
        if rest
            .chars()
            .next()
            .map(|c| c.is_alphanumeric() || c == '_')
            .unwrap_or(false)
        {
            return Err(nom::Err::Error(VerboseError { errors: vec![] }));
        }
        Ok((rest, matched))
    }
}

/// One to three dot-separated identifier segments.
fn segments(input: &str) -> IResult<Vec<String>> {
    let (rest, parts) = separated_list1(char('.'), identifier)(input)?;
    if parts.len() > 3 {
        return Err(nom::Err::Error(VerboseError { errors: vec![] }));
    }
    Ok((rest, parts))
}

fn measurement_name(input: &str) -> IResult<MeasurementName> {
    map(segments, |parts| {
        let mut m = MeasurementName::default();
        match parts.len() {
            1 => m.name = parts[0].clone(),
            2 => {
                m.policy = Some(parts[0].clone());
                m.name = parts[1].clone();
            }
            _ => {
                m.database = Some(parts[0].clone());
                m.policy = Some(parts[1].clone());
                m.name = parts[2].clone();
            }
        }
        m
    })(input)
}

fn aggregate(input: &str) -> IResult<Aggregate> {
    alt((
        value(Aggregate::Count, keyword("COUNT")),
        value(Aggregate::Sum, keyword("SUM")),
        value(Aggregate::Mean, keyword("MEAN")),
        value(Aggregate::Min, keyword("MIN")),
        value(Aggregate::Max, keyword("MAX")),
        value(Aggregate::First, keyword("FIRST")),
        value(Aggregate::Last, keyword("LAST")),
    ))(input)
}

fn select_field(input: &str) -> IResult<SelectField> {
    let aggregate_call = map(
        tuple((
            aggregate,
            ws(char('(')),
            identifier,
            ws(char(')')),
            opt(preceded(ws(keyword("AS")), identifier)),
        )),
        |(function, _, name, _, alias)| SelectField::Field {
            function: Some(function),
            name,
            alias,
        },
    );
    let plain = map(
        pair(identifier, opt(preceded(ws(keyword("AS")), identifier))),
        |(name, alias)| SelectField::Field {
            function: None,
            name,
            alias,
        },
    );
    alt((
        value(SelectField::Wildcard, char('*')),
        aggregate_call,
        plain,
    ))(input)
}

enum Condition {
    Tag(String, String),
    TimeStart(i64),
    TimeEnd(i64),
}

fn condition(input: &str) -> IResult<Condition> {
    let time_cond = map(
        tuple((
            keyword("TIME"),
            ws(alt((tag(">="), tag("<="), tag(">"), tag("<")))),
            integer_literal,
        )),
        |(_, op, v)| match op {
            ">=" => Condition::TimeStart(v),
            ">" => Condition::TimeStart(v + 1),
            "<=" => Condition::TimeEnd(v + 1),
            _ => Condition::TimeEnd(v),
        },
    );
    let tag_cond = map(
        tuple((identifier, ws(char('=')), string_literal)),
        |(key, _, val)| Condition::Tag(key, val),
    );
    alt((time_cond, tag_cond))(input)
}

enum GroupByItem {
    TimeInterval(i64),
    Tag(String),
}

fn group_by_item(input: &str) -> IResult<GroupByItem> {
    let time_item = map(
        tuple((keyword("TIME"), ws(char('(')), duration_literal, ws(char(')')))),
        |(_, _, interval, _)| GroupByItem::TimeInterval(interval),
    );
    alt((time_item, map(identifier, GroupByItem::Tag)))(input)
}

fn select_statement(input: &str) -> IResult<SelectStatement> {
    let (input, _) = keyword("SELECT")(input)?;
    let (input, fields) = separated_list1(ws(char(',')), ws(select_field))(input)?;
    let (input, into) = opt(preceded(ws(keyword("INTO")), segments))(input)?;
    let (input, _) = ws(keyword("FROM"))(input)?;
    let (input, source) = measurement_name(input)?;
    let (input, conditions) = opt(preceded(
        ws(keyword("WHERE")),
        separated_list1(ws(keyword("AND")), condition),
    ))(input)?;
    let (input, group_by) = opt(preceded(
        tuple((ws(keyword("GROUP")), keyword("BY"), multispace1)),
        separated_list1(ws(char(',')), group_by_item),
    ))(input)?;

    let mut stmt = SelectStatement {
        fields,
        into: into.unwrap_or_default(),
        source,
        ..SelectStatement::default()
    };
    for cond in conditions.unwrap_or_default() {
        match cond {
            Condition::Tag(k, v) => {
                stmt.tag_filter.insert(k, v);
            }
            Condition::TimeStart(v) => stmt.time_start = Some(v),
            Condition::TimeEnd(v) => stmt.time_end = Some(v),
        }
    }
    for item in group_by.unwrap_or_default() {
        match item {
            GroupByItem::TimeInterval(i) => stmt.group_by_interval = Some(i),
            GroupByItem::Tag(t) => stmt.group_by_tags.push(t),
        }
    }
    Ok((input, stmt))
}

fn privilege(input: &str) -> IResult<Privilege> {
    alt((
        value(Privilege::Read, keyword("READ")),
        value(Privilege::Write, keyword("WRITE")),
        value(
            Privilege::All,
            pair(keyword("ALL"), opt(preceded(multispace1, keyword("PRIVILEGES")))),
        ),
    ))(input)
}

fn statement(input: &str) -> IResult<Statement> {
    alt((
        map(select_statement, Statement::Select),
        create_statement,
        drop_statement,
        alter_retention_policy,
        show_statement,
        grant_statement,
        revoke_statement,
    ))(input)
}

fn create_statement(input: &str) -> IResult<Statement> {
    preceded(
        pair(keyword("CREATE"), multispace1),
        alt((
            map(preceded(pair(keyword("DATABASE"), multispace1), identifier), |name| {
                Statement::CreateDatabase { name }
            }),
            create_retention_policy,
            create_user,
            create_continuous_query,
        )),
    )(input)
}

fn create_retention_policy(input: &str) -> IResult<Statement> {
    let (input, _) = tuple((keyword("RETENTION"), multispace1, keyword("POLICY")))(input)?;
    let (input, name) = ws(identifier)(input)?;
    let (input, _) = keyword("ON")(input)?;
    let (input, database) = ws(identifier)(input)?;
    let (input, _) = keyword("DURATION")(input)?;
    let (input, duration) = ws(duration_literal)(input)?;
    let (input, _) = keyword("REPLICATION")(input)?;
    let (input, replica_n) = ws(integer_literal)(input)?;
    let (input, default) = opt(keyword("DEFAULT"))(input)?;
    Ok((
        input,
        Statement::CreateRetentionPolicy {
            database,
            name,
            duration,
            replica_n: replica_n.max(1) as u32,
            default: default.is_some(),
        },
    ))
}

fn alter_retention_policy(input: &str) -> IResult<Statement> {
    let (input, _) = tuple((
        keyword("ALTER"),
        multispace1,
        keyword("RETENTION"),
        multispace1,
        keyword("POLICY"),
    ))(input)?;
    let (input, name) = ws(identifier)(input)?;
    let (input, _) = keyword("ON")(input)?;
    let (input, database) = ws(identifier)(input)?;
    let (input, duration) = opt(preceded(ws(keyword("DURATION")), duration_literal))(input)?;
    let (input, replica_n) = opt(preceded(ws(keyword("REPLICATION")), integer_literal))(input)?;
    let (input, default) = opt(ws(keyword("DEFAULT")))(input)?;
    Ok((
        input,
        Statement::AlterRetentionPolicy {
            database,
            name,
            duration,
            replica_n: replica_n.map(|n| n.max(1) as u32),
            default: default.is_some(),
        },
    ))
}

fn create_user(input: &str) -> IResult<Statement> {
    let (input, _) = keyword("USER")(input)?;
    let (input, name) = ws(identifier)(input)?;
    let (input, _) = tuple((keyword("WITH"), multispace1, keyword("PASSWORD")))(input)?;
    let (input, password) = ws(string_literal)(input)?;
    let (input, admin) = opt(tuple((
        keyword("WITH"),
        multispace1,
        keyword("ALL"),
        multispace1,
        keyword("PRIVILEGES"),
    )))(input)?;
    Ok((
        input,
        Statement::CreateUser {
            name,
            password,
            admin: admin.is_some(),
        },
    ))
}

fn create_continuous_query(input: &str) -> IResult<Statement> {
    let (input, _) = tuple((keyword("CONTINUOUS"), multispace1, keyword("QUERY")))(input)?;
    let (input, name) = ws(identifier)(input)?;
    let (input, _) = keyword("ON")(input)?;
    let (input, database) = ws(identifier)(input)?;
    let (input, _) = keyword("BEGIN")(input)?;
    let (input, select) = ws(select_statement)(input)?;
    let (input, _) = keyword("END")(input)?;
    Ok((
        input,
        Statement::CreateContinuousQuery(CreateContinuousQueryStatement {
            name,
            database,
            select,
            text: String::new(),
        }),
    ))
}

fn drop_statement(input: &str) -> IResult<Statement> {
    preceded(
        pair(keyword("DROP"), multispace1),
        alt((
            map(preceded(pair(keyword("DATABASE"), multispace1), identifier), |name| {
                Statement::DropDatabase { name }
            }),
            map(preceded(pair(keyword("USER"), multispace1), identifier), |name| {
                Statement::DropUser { name }
            }),
            drop_retention_policy,
        )),
    )(input)
}

fn drop_retention_policy(input: &str) -> IResult<Statement> {
    let (input, _) = tuple((keyword("RETENTION"), multispace1, keyword("POLICY")))(input)?;
    let (input, name) = ws(identifier)(input)?;
    let (input, _) = keyword("ON")(input)?;
    let (input, database) = ws(identifier)(input)?;
    Ok((input, Statement::DropRetentionPolicy { database, name }))
}

fn show_statement(input: &str) -> IResult<Statement> {
    let (input, _) = pair(keyword("SHOW"), multispace1)(input)?;
    alt((
        value(Statement::ShowDatabases, keyword("DATABASES")),
        value(Statement::ShowMeasurements, keyword("MEASUREMENTS")),
        value(Statement::ShowUsers, keyword("USERS")),
        map(
            preceded(
                tuple((keyword("RETENTION"), multispace1, keyword("POLICIES"))),
                preceded(opt(ws(keyword("ON"))), ws(identifier)),
            ),
            |database| Statement::ShowRetentionPolicies { database },
        ),
        value(
            Statement::ShowContinuousQueries,
            tuple((keyword("CONTINUOUS"), multispace1, keyword("QUERIES"))),
        ),
        map(
            preceded(keyword("SERIES"), opt(preceded(ws(keyword("FROM")), measurement_name))),
            |source| Statement::ShowSeries { source },
        ),
        show_tag_statement,
        map(
            preceded(
                tuple((keyword("FIELD"), multispace1, keyword("KEYS"))),
                opt(preceded(ws(keyword("FROM")), measurement_name)),
            ),
            |source| Statement::ShowFieldKeys { source },
        ),
    ))(input)
}

fn show_tag_statement(input: &str) -> IResult<Statement> {
    let (input, _) = pair(keyword("TAG"), multispace1)(input)?;
    alt((
        map(
            preceded(keyword("KEYS"), opt(preceded(ws(keyword("FROM")), measurement_name))),
            |source| Statement::ShowTagKeys { source },
        ),
        map(
            tuple((
                keyword("VALUES"),
                opt(preceded(ws(keyword("FROM")), measurement_name)),
                ws(keyword("WITH")),
                keyword("KEY"),
                ws(char('=')),
                identifier,
            )),
            |(_, source, _, _, _, key)| Statement::ShowTagValues { source, key },
        ),
    ))(input)
}

fn grant_statement(input: &str) -> IResult<Statement> {
    let (input, _) = pair(keyword("GRANT"), multispace1)(input)?;
    let (input, privilege_) = privilege(input)?;
    let (input, database) = opt(preceded(ws(keyword("ON")), identifier))(input)?;
    let (input, _) = ws(keyword("TO"))(input)?;
    let (input, user) = identifier(input)?;
    Ok((
        input,
        Statement::Grant {
            privilege: privilege_,
            database,
            user,
        },
    ))
}

fn revoke_statement(input: &str) -> IResult<Statement> {
    let (input, _) = pair(keyword("REVOKE"), multispace1)(input)?;
    let (input, privilege_) = privilege(input)?;
    let (input, database) = opt(preceded(ws(keyword("ON")), identifier))(input)?;
    let (input, _) = ws(keyword("FROM"))(input)?;
    let (input, user) = identifier(input)?;
    Ok((
        input,
        Statement::Revoke {
            privilege: privilege_,
            database,
            user,
        },
    ))
}
