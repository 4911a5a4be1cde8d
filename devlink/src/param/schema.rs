//! Parser for the `par_print` parameter listing.
//!
//! ```text
//! ;id,name,type,access,nvm,value,min,max,unit,comment
//! :Motor
//! 1,max_speed,int,RW,Y,1200,0,3000,rpm,Top speed
//! 2,mode,enum:idle|run|hold,RW,N,0,,,,
//! ;END
//! ```
//!
//! Devices older than 2.0.0 print the legacy layout instead:
//! `id,name,value,default,min,max,comment,type,` with every entry read-write
//! and stored.

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::param::{
    Access, Parameter, ParameterTable, ParameterType, ParameterValue, Persistence, Range,
};
use crate::protocol::text::SCHEMA_END;

/// Listing layout, chosen by device version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFormat {
    /// `id,name,value,default,min,max,comment,type,`
    Legacy,
    /// `id,name,type,access,nvm,value,min,max,unit,comment`
    Current,
}

const CURRENT_FIELDS: usize = 10;
/// Legacy entries end with a comma, leaving 8 fields once it is stripped.
const LEGACY_FIELDS: usize = 8;

/// Incremental listing parser fed one line at a time.
#[derive(Debug)]
pub struct SchemaParser {
    format: SchemaFormat,
    group: Option<String>,
    params: Vec<Parameter>,
    finished: bool,
}

impl SchemaParser {
    /// Parser for `format`.
    pub fn new(format: SchemaFormat) -> Self {
        Self {
            format,
            group: None,
            params: Vec::new(),
            finished: false,
        }
    }

    /// Consume one line. Returns `true` once the end marker was seen.
    pub fn feed(&mut self, line: &str) -> Result<bool> {
        let line = line.trim();
        if line.is_empty() || self.finished {
            return Ok(self.finished);
        }
        if line.eq_ignore_ascii_case(SCHEMA_END) {
            self.finished = true;
            return Ok(true);
        }
        if line.starts_with(';') {
            trace!("Listing header: {line}");
            return Ok(false);
        }
        if let Some(group) = line.strip_prefix(':') {
            self.group = Some(group.trim().to_string());
            return Ok(false);
        }

        let mut param = match self.format {
            SchemaFormat::Legacy => parse_legacy(line)?,
            SchemaFormat::Current => parse_current(line)?,
        };
        param.group.clone_from(&self.group);
        self.params.push(param);
        Ok(false)
    }

    /// Whether the end marker was seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Build the table.
    pub fn finish(self) -> Result<ParameterTable> {
        debug!("Parsed {} parameter(s) from listing", self.params.len());
        ParameterTable::from_parameters(self.params)
    }
}

/// Parse a complete listing.
pub fn parse_listing<I, S>(lines: I, format: SchemaFormat) -> Result<ParameterTable>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parser = SchemaParser::new(format);
    for line in lines {
        if parser.feed(line.as_ref())? {
            break;
        }
    }
    parser.finish()
}

/// Render `table` the way a device of `format` prints it.
pub fn render_listing(table: &ParameterTable, format: SchemaFormat) -> Vec<String> {
    let mut lines = vec![match format {
        SchemaFormat::Legacy => ";id,name,value,default,min,max,comment,type,".to_string(),
        SchemaFormat::Current => ";id,name,type,access,nvm,value,min,max,unit,comment".to_string(),
    }];
    let mut group: Option<&str> = None;
    for param in table.iter() {
        if param.group.as_deref() != group {
            group = param.group.as_deref();
            if let Some(name) = group {
                lines.push(format!(":{name}"));
            }
        }
        lines.push(render_entry(param, format));
    }
    lines.push(SCHEMA_END.to_string());
    lines
}

/// Render one listing entry.
pub fn render_entry(param: &Parameter, format: SchemaFormat) -> String {
    let value = param
        .value()
        .filter(|_| param.access.is_readable())
        .map(|v| v.to_string())
        .unwrap_or_default();
    let min = bound_text(param.range.min);
    let max = bound_text(param.range.max);
    match format {
        SchemaFormat::Legacy => {
            let default = param
                .default
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            format!(
                "{},{},{value},{default},{min},{max},{},{},",
                param.id,
                param.name,
                param.comment.replace(',', ";"),
                type_token(&param.kind)
            )
        },
        SchemaFormat::Current => format!(
            "{},{},{},{},{},{value},{min},{max},{},{}",
            param.id,
            param.name,
            type_token(&param.kind),
            access_token(param.access),
            match param.persistence {
                Persistence::Stored => "Y",
                Persistence::Volatile => "N",
            },
            param.unit,
            param.comment
        ),
    }
}

fn parse_current(line: &str) -> Result<Parameter> {
    let fields: Vec<&str> = line.splitn(CURRENT_FIELDS, ',').collect();
    if fields.len() != CURRENT_FIELDS {
        return Err(malformed(line, "expected 10 fields"));
    }
    let id = parse_id(fields[0], line)?;
    let kind = parse_type(fields[2], line)?;
    let access = match fields[3].trim() {
        "RO" => Access::ReadOnly,
        "RW" => Access::ReadWrite,
        "WO" => Access::WriteOnly,
        other => return Err(malformed(line, &format!("unknown access '{other}'"))),
    };
    let persistence = match fields[4].trim() {
        "Y" | "y" => Persistence::Stored,
        "N" | "n" => Persistence::Volatile,
        other => return Err(malformed(line, &format!("unknown nvm flag '{other}'"))),
    };

    let mut param = Parameter::new(id, fields[1].trim(), kind)
        .with_access(access)
        .with_persistence(persistence)
        .with_range(Range {
            min: parse_bound(fields[6], line)?,
            max: parse_bound(fields[7], line)?,
        });
    param.unit = fields[8].trim().to_string();
    param.comment = fields[9].trim().to_string();
    if let Some(value) = parse_value(&param.kind, fields[5], line)? {
        param = param.with_value(value);
    }
    Ok(param)
}

fn parse_legacy(line: &str) -> Result<Parameter> {
    let line_body = line.strip_suffix(',').unwrap_or(line);
    let fields: Vec<&str> = line_body.split(',').collect();
    if fields.len() != LEGACY_FIELDS {
        return Err(malformed(
            line,
            &format!("expected {LEGACY_FIELDS} fields, got {}", fields.len()),
        ));
    }
    let last = LEGACY_FIELDS - 1;
    let id = parse_id(fields[0], line)?;
    let kind = parse_type(fields[last], line)?;

    let mut param = Parameter::new(id, fields[1].trim(), kind).with_range(Range {
        min: parse_bound(fields[4], line)?,
        max: parse_bound(fields[5], line)?,
    });
    param.comment = fields[6].trim().to_string();
    param.default = parse_value(&param.kind, fields[3], line)?;
    if let Some(value) = parse_value(&param.kind, fields[2], line)? {
        param = param.with_value(value);
    }
    Ok(param)
}

fn parse_id(field: &str, line: &str) -> Result<u16> {
    field
        .trim()
        .parse()
        .map_err(|_| malformed(line, &format!("invalid id '{}'", field.trim())))
}

fn parse_type(token: &str, line: &str) -> Result<ParameterType> {
    let token = token.trim();
    if let Some(variants) = token.strip_prefix("enum:") {
        let variants: Vec<String> = variants
            .split('|')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if variants.is_empty() || variants.len() > usize::from(u8::MAX) + 1 {
            return Err(malformed(line, "enum needs 1 to 256 variants"));
        }
        return Ok(ParameterType::Enumerated(variants));
    }
    match token {
        "int" => Ok(ParameterType::Integer),
        "float" => Ok(ParameterType::Float),
        "str" => Ok(ParameterType::String),
        "bool" => Ok(ParameterType::Boolean),
        other => Err(malformed(line, &format!("unknown type '{other}'"))),
    }
}

fn parse_bound(field: &str, line: &str) -> Result<Option<f64>> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(None);
    }
    field
        .parse()
        .map(Some)
        .map_err(|_| malformed(line, &format!("invalid bound '{field}'")))
}

fn parse_value(kind: &ParameterType, field: &str, line: &str) -> Result<Option<ParameterValue>> {
    if field.trim().is_empty() {
        return Ok(None);
    }
    ParameterValue::parse_text(kind, field)
        .map(Some)
        .map_err(|e| malformed(line, &e.to_string()))
}

fn type_token(kind: &ParameterType) -> String {
    match kind {
        ParameterType::Integer => "int".to_string(),
        ParameterType::Float => "float".to_string(),
        ParameterType::String => "str".to_string(),
        ParameterType::Boolean => "bool".to_string(),
        ParameterType::Enumerated(variants) => format!("enum:{}", variants.join("|")),
    }
}

fn access_token(access: Access) -> &'static str {
    match access {
        Access::ReadOnly => "RO",
        Access::ReadWrite => "RW",
        Access::WriteOnly => "WO",
    }
}

fn bound_text(bound: Option<f64>) -> String {
    bound.map(|b| b.to_string()).unwrap_or_default()
}

fn malformed(line: &str, reason: &str) -> Error {
    Error::Protocol(format!("bad listing entry '{line}': {reason}"))
}
