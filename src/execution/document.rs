//! Operation documents understood by the built-in [`Schema`] engine.
//!
//! Parsing is delegated to `graphql-parser`; the resulting AST is lowered
//! into the small executable subset the engine runs: one or more
//! operations (or a single anonymous selection set), variable defaults,
//! fields with aliases, arguments and nested selection sets. Fragments
//! and directives are rejected.
//!
//! Documents nested deeper than [`MAX_DEPTH`] are rejected before they
//! reach the parser, so hostile input cannot exhaust the stack.
//!
//! [`Schema`]: super::Schema

use std::collections::BTreeMap;

use graphql_parser::Pos;
use graphql_parser::query as ast;
use serde_json::{Map, Number, Value};

use super::result::{GraphQLError, Location};

/// Kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// `query` (also the anonymous `{ ... }` shorthand).
    Query,
    /// `mutation`.
    Mutation,
    /// `subscription`.
    Subscription,
}

/// Argument value as written in the document.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// `$name` reference, resolved against the operation's variables.
    Variable(String),
    /// Literal scalar, enum or `null`.
    Const(Value),
    /// `[ ... ]`.
    List(Vec<InputValue>),
    /// `{ key: value, ... }`.
    Object(Vec<(String, InputValue)>),
}

impl InputValue {
    /// Resolves variable references, yielding `null` for unknown variables.
    #[must_use]
    pub fn resolve(&self, variables: &Map<String, Value>) -> Value {
        match self {
            Self::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
            Self::Const(value) => value.clone(),
            Self::List(items) => Value::Array(items.iter().map(|i| i.resolve(variables)).collect()),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.resolve(variables)))
                    .collect(),
            ),
        }
    }
}

/// One selected field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Response key override.
    pub alias: Option<String>,
    /// Field name.
    pub name: String,
    /// Arguments in document order.
    pub arguments: Vec<(String, InputValue)>,
    /// Nested selection; empty for leaf fields.
    pub selection: Vec<Field>,
    /// Position of the field name.
    pub location: Location,
}

impl Field {
    /// Key under which the field appears in the response.
    #[must_use]
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Resolves all arguments against `variables`.
    #[must_use]
    pub fn resolve_arguments(&self, variables: &Map<String, Value>) -> Map<String, Value> {
        self.arguments
            .iter()
            .map(|(name, value)| (name.clone(), value.resolve(variables)))
            .collect()
    }
}

/// One operation definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Optional operation name.
    pub name: Option<String>,
    /// Default values of declared variables.
    pub variable_defaults: Map<String, Value>,
    /// Root selection set.
    pub selection: Vec<Field>,
    /// Position of the operation keyword or opening brace.
    pub location: Location,
}

/// Parsed executable document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Operations in document order.
    pub operations: Vec<Operation>,
}

impl Document {
    /// Parses `source`.
    ///
    /// # Errors
    ///
    /// Returns a syntax [`GraphQLError`] with the offending location.
    pub fn parse(source: &str) -> Result<Self, GraphQLError> {
        check_depth(source)?;
        let parsed = ast::parse_query::<String>(source).map_err(|err| syntax_error(&err))?;
        let operations = parsed
            .definitions
            .into_iter()
            .map(|definition| match definition {
                ast::Definition::Operation(operation) => lower_operation(operation),
                ast::Definition::Fragment(fragment) => Err(GraphQLError::new(
                    "Fragments are not supported by this server.",
                )
                .at(location(fragment.position))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { operations })
    }

    /// Selects the operation to execute.
    ///
    /// # Errors
    ///
    /// Fails when `name` matches no operation, or when `name` is absent and
    /// the document holds more than one operation.
    pub fn operation(&self, name: Option<&str>) -> Result<&Operation, GraphQLError> {
        match name {
            Some(name) => self
                .operations
                .iter()
                .find(|op| op.name.as_deref() == Some(name))
                .ok_or_else(|| GraphQLError::new(format!("Unknown operation named '{name}'."))),
            None => match self.operations.as_slice() {
                [only] => Ok(only),
                _ => Err(GraphQLError::new(
                    "Must provide operation name if query contains multiple operations.",
                )),
            },
        }
    }
}

/// Deepest bracket nesting accepted in a document.
pub const MAX_DEPTH: usize = 64;

/// Rejects documents whose `{`, `[` or `(` nesting exceeds [`MAX_DEPTH`].
/// String literals and comments are skipped.
fn check_depth(source: &str) -> Result<(), GraphQLError> {
    let mut depth = 0usize;
    let mut line = 1;
    let mut column = 0;
    let mut chars = source.chars().peekable();
    let mut in_string = false;
    let mut in_comment = false;
    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
            column = 0;
            in_comment = false;
            continue;
        }
        column += 1;
        if in_comment {
            continue;
        }
        if in_string {
            match c {
                '\\' => {
                    chars.next();
                    column += 1;
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '#' => in_comment = true,
            '"' => in_string = true,
            '{' | '[' | '(' => {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(GraphQLError::syntax(
                        "Document nested too deeply.",
                        Location { line, column },
                    ));
                }
            }
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

/// Converts a parser failure into a located syntax error.
///
/// The parser reports `Parse error at LINE:COL` followed by one line per
/// unexpected or expected token.
fn syntax_error(err: &ast::ParseError) -> GraphQLError {
    let text = err.to_string();
    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    let location = header
        .rsplit_once(" at ")
        .and_then(|(_, pos)| pos.trim().split_once(':'))
        .and_then(|(line, column)| Some(Location {
            line: line.trim().parse().ok()?,
            column: column.trim().parse().ok()?,
        }))
        .unwrap_or(Location { line: 1, column: 1 });
    let details: Vec<&str> = lines.map(str::trim).filter(|l| !l.is_empty()).collect();
    let description = if details.is_empty() {
        header.to_string()
    } else {
        details.join("; ")
    };
    GraphQLError::syntax(description, location)
}

const fn location(pos: Pos) -> Location {
    Location {
        line: pos.line,
        column: pos.column,
    }
}

fn lower_operation(
    operation: ast::OperationDefinition<'_, String>,
) -> Result<Operation, GraphQLError> {
    let (kind, position, name, variables, directives, selection_set) = match operation {
        ast::OperationDefinition::SelectionSet(set) => {
            let position = set.span.0;
            (OperationKind::Query, position, None, Vec::new(), Vec::new(), set)
        }
        ast::OperationDefinition::Query(q) => (
            OperationKind::Query,
            q.position,
            q.name,
            q.variable_definitions,
            q.directives,
            q.selection_set,
        ),
        ast::OperationDefinition::Mutation(m) => (
            OperationKind::Mutation,
            m.position,
            m.name,
            m.variable_definitions,
            m.directives,
            m.selection_set,
        ),
        ast::OperationDefinition::Subscription(s) => (
            OperationKind::Subscription,
            s.position,
            s.name,
            s.variable_definitions,
            s.directives,
            s.selection_set,
        ),
    };
    reject_directives(&directives, position)?;

    let mut variable_defaults = Map::new();
    for variable in variables {
        if let Some(default) = variable.default_value {
            variable_defaults.insert(variable.name, lower_value(default).resolve(&Map::new()));
        }
    }

    Ok(Operation {
        kind,
        name,
        variable_defaults,
        selection: lower_selection(selection_set)?,
        location: location(position),
    })
}

fn reject_directives(
    directives: &[ast::Directive<'_, String>],
    position: Pos,
) -> Result<(), GraphQLError> {
    match directives.first() {
        Some(directive) => Err(GraphQLError::new(format!(
            "Directive '@{}' is not supported by this server.",
            directive.name
        ))
        .at(location(position))),
        None => Ok(()),
    }
}

fn lower_selection(set: ast::SelectionSet<'_, String>) -> Result<Vec<Field>, GraphQLError> {
    set.items
        .into_iter()
        .map(|selection| match selection {
            ast::Selection::Field(field) => lower_field(field),
            ast::Selection::FragmentSpread(spread) => Err(GraphQLError::new(
                "Fragments are not supported by this server.",
            )
            .at(location(spread.position))),
            ast::Selection::InlineFragment(fragment) => Err(GraphQLError::new(
                "Fragments are not supported by this server.",
            )
            .at(location(fragment.position))),
        })
        .collect()
}

fn lower_field(field: ast::Field<'_, String>) -> Result<Field, GraphQLError> {
    reject_directives(&field.directives, field.position)?;
    Ok(Field {
        alias: field.alias,
        name: field.name,
        arguments: field
            .arguments
            .into_iter()
            .map(|(name, value)| (name, lower_value(value)))
            .collect(),
        selection: lower_selection(field.selection_set)?,
        location: location(field.position),
    })
}

fn lower_value(value: ast::Value<'_, String>) -> InputValue {
    match value {
        ast::Value::Variable(name) => InputValue::Variable(name),
        ast::Value::Int(n) => InputValue::Const(n.as_i64().map_or(Value::Null, Value::from)),
        ast::Value::Float(f) => {
            InputValue::Const(Number::from_f64(f).map_or(Value::Null, Value::Number))
        }
        ast::Value::String(s) => InputValue::Const(Value::String(s)),
        ast::Value::Boolean(b) => InputValue::Const(Value::Bool(b)),
        ast::Value::Null => InputValue::Const(Value::Null),
        ast::Value::Enum(name) => InputValue::Const(Value::String(name)),
        ast::Value::List(items) => InputValue::List(items.into_iter().map(lower_value).collect()),
        ast::Value::Object(fields) => InputValue::Object(lower_object(fields)),
    }
}

fn lower_object(fields: BTreeMap<String, ast::Value<'_, String>>) -> Vec<(String, InputValue)> {
    fields
        .into_iter()
        .map(|(key, value)| (key, lower_value(value)))
        .collect()
}
