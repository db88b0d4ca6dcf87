//! Token-budgeted GraphQL parsing and deterministic document rendering.
//!
//! Signatures are computed over the canonical form, so two spellings of
//! the same executable document must render byte-identically: single
//! spaces between tokens, fields in written order, directive arguments
//! sorted by name, comments dropped. The budget scan runs over the raw
//! text before the AST is built, keeping hostile inputs cheap to reject.

use std::sync::Arc;

use dashmap::DashMap;
use graphql_parser::query::{
    Definition, Directive, Document, Field, FragmentDefinition, FragmentSpread, InlineFragment,
    OperationDefinition, Selection, SelectionSet, Type, TypeCondition, Value, VariableDefinition,
};
use once_cell::sync::Lazy;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CanonError {
    #[error("document exceeds the token budget")]
    TokenLimit,
    #[error("syntax error: {0}")]
    Syntax(String),
}

/// Raw source text to canonical rendering. Unbounded on purpose: the set
/// of distinct documents a deployment sees is the set of its registered
/// or signed operations. Callers that proxy arbitrary text must bound
/// their own store.
static MEMO: Lazy<DashMap<String, Arc<str>>> = Lazy::new(DashMap::new);

/// Parse `text` into an executable document, rejecting it before AST
/// construction when the lexical token count exceeds `max_tokens`.
pub fn parse(text: &str, max_tokens: usize) -> Result<Document<'_, String>, CanonError> {
    scan_token_count(text, max_tokens)?;
    graphql_parser::parse_query::<String>(text).map_err(|err| CanonError::Syntax(err.to_string()))
}

/// Canonical rendering of `text`, memoized process-wide. The budget scan
/// still runs on every call so a cached document cannot bypass a smaller
/// budget.
pub fn canonical(text: &str, max_tokens: usize) -> Result<Arc<str>, CanonError> {
    scan_token_count(text, max_tokens)?;
    if let Some(hit) = MEMO.get(text) {
        return Ok(Arc::clone(hit.value()));
    }
    let doc =
        graphql_parser::parse_query::<String>(text).map_err(|err| CanonError::Syntax(err.to_string()))?;
    let rendered: Arc<str> = Arc::from(render_document(&doc));
    MEMO.insert(text.to_string(), Arc::clone(&rendered));
    Ok(rendered)
}

/// Counts lexical tokens per the GraphQL grammar: punctuators, names,
/// numbers and strings count; whitespace, commas, comments and the BOM
/// are ignorable.
fn scan_token_count(text: &str, max_tokens: usize) -> Result<(), CanonError> {
    let bytes = text.as_bytes();
    let mut i = 0usize;
    let mut count = 0usize;

    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        i = 3;
    }

    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' | b'\n' | b',' => {
                i += 1;
                continue;
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'.' if bytes[i..].starts_with(b"...") => {
                i += 3;
            }
            b'"' => {
                if bytes[i..].starts_with(b"\"\"\"") {
                    i += 3;
                    while i < bytes.len() && !bytes[i..].starts_with(b"\"\"\"") {
                        if bytes[i..].starts_with(b"\\\"\"\"") {
                            i += 4;
                        } else {
                            i += 1;
                        }
                    }
                    i = (i + 3).min(bytes.len());
                } else {
                    i += 1;
                    while i < bytes.len() && bytes[i] != b'"' && bytes[i] != b'\n' {
                        if bytes[i] == b'\\' {
                            i += 2;
                        } else {
                            i += 1;
                        }
                    }
                    i = (i + 1).min(bytes.len());
                }
            }
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                i += 1;
                while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
            }
            b'-' | b'0'..=b'9' => {
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit()
                        || matches!(bytes[i], b'.' | b'e' | b'E' | b'+' | b'-'))
                {
                    i += 1;
                }
            }
            _ => {
                i += 1;
            }
        }
        count += 1;
        if count > max_tokens {
            return Err(CanonError::TokenLimit);
        }
    }

    Ok(())
}

fn render_document(doc: &Document<'_, String>) -> String {
    let mut out = String::new();
    for (index, definition) in doc.definitions.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        match definition {
            Definition::Operation(operation) => render_operation(operation, &mut out),
            Definition::Fragment(fragment) => render_fragment(fragment, &mut out),
        }
    }
    out
}

fn render_operation(operation: &OperationDefinition<'_, String>, out: &mut String) {
    match operation {
        OperationDefinition::SelectionSet(set) => render_selection_set(set, out),
        OperationDefinition::Query(query) => render_operation_parts(
            "query",
            query.name.as_deref(),
            &query.variable_definitions,
            &query.directives,
            &query.selection_set,
            out,
        ),
        OperationDefinition::Mutation(mutation) => render_operation_parts(
            "mutation",
            mutation.name.as_deref(),
            &mutation.variable_definitions,
            &mutation.directives,
            &mutation.selection_set,
            out,
        ),
        OperationDefinition::Subscription(subscription) => render_operation_parts(
            "subscription",
            subscription.name.as_deref(),
            &subscription.variable_definitions,
            &subscription.directives,
            &subscription.selection_set,
            out,
        ),
    }
}

fn render_operation_parts(
    keyword: &str,
    name: Option<&str>,
    variables: &[VariableDefinition<'_, String>],
    directives: &[Directive<'_, String>],
    selection_set: &SelectionSet<'_, String>,
    out: &mut String,
) {
    out.push_str(keyword);
    if let Some(name) = name {
        out.push(' ');
        out.push_str(name);
    }
    if !variables.is_empty() {
        out.push('(');
        for (index, variable) in variables.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            out.push('$');
            out.push_str(&variable.name);
            out.push_str(": ");
            render_type(&variable.var_type, out);
            if let Some(default) = &variable.default_value {
                out.push_str(" = ");
                render_value(default, out);
            }
        }
        out.push(')');
    }
    render_directives(directives, out);
    out.push(' ');
    render_selection_set(selection_set, out);
}

fn render_fragment(fragment: &FragmentDefinition<'_, String>, out: &mut String) {
    out.push_str("fragment ");
    out.push_str(&fragment.name);
    let TypeCondition::On(on_type) = &fragment.type_condition;
    out.push_str(" on ");
    out.push_str(on_type);
    render_directives(&fragment.directives, out);
    out.push(' ');
    render_selection_set(&fragment.selection_set, out);
}

fn render_selection_set(set: &SelectionSet<'_, String>, out: &mut String) {
    out.push('{');
    for item in &set.items {
        out.push(' ');
        render_selection(item, out);
    }
    out.push_str(" }");
}

fn render_selection(selection: &Selection<'_, String>, out: &mut String) {
    match selection {
        Selection::Field(field) => render_field(field, out),
        Selection::FragmentSpread(spread) => render_fragment_spread(spread, out),
        Selection::InlineFragment(inline) => render_inline_fragment(inline, out),
    }
}

fn render_field(field: &Field<'_, String>, out: &mut String) {
    if let Some(alias) = &field.alias {
        out.push_str(alias);
        out.push_str(": ");
    }
    out.push_str(&field.name);
    // Field arguments keep their written order; only directive arguments
    // are order-normalized.
    render_arguments(&field.arguments, out);
    render_directives(&field.directives, out);
    if !field.selection_set.items.is_empty() {
        out.push(' ');
        render_selection_set(&field.selection_set, out);
    }
}

fn render_fragment_spread(spread: &FragmentSpread<'_, String>, out: &mut String) {
    out.push_str("...");
    out.push_str(&spread.fragment_name);
    render_directives(&spread.directives, out);
}

fn render_inline_fragment(inline: &InlineFragment<'_, String>, out: &mut String) {
    out.push_str("...");
    if let Some(TypeCondition::On(on_type)) = &inline.type_condition {
        out.push_str(" on ");
        out.push_str(on_type);
    }
    render_directives(&inline.directives, out);
    out.push(' ');
    render_selection_set(&inline.selection_set, out);
}

fn render_arguments(arguments: &[(String, Value<'_, String>)], out: &mut String) {
    if arguments.is_empty() {
        return;
    }
    out.push('(');
    for (index, (name, value)) in arguments.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push_str(": ");
        render_value(value, out);
    }
    out.push(')');
}

fn render_directives(directives: &[Directive<'_, String>], out: &mut String) {
    for directive in directives {
        out.push_str(" @");
        out.push_str(&directive.name);
        if directive.arguments.is_empty() {
            continue;
        }
        let mut arguments: Vec<&(String, Value<'_, String>)> = directive.arguments.iter().collect();
        arguments.sort_by(|a, b| a.0.cmp(&b.0));
        out.push('(');
        for (index, (name, value)) in arguments.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            out.push_str(name);
            out.push_str(": ");
            render_value(value, out);
        }
        out.push(')');
    }
}

fn render_type(ty: &Type<'_, String>, out: &mut String) {
    match ty {
        Type::NamedType(name) => out.push_str(name),
        Type::ListType(inner) => {
            out.push('[');
            render_type(inner, out);
            out.push(']');
        }
        Type::NonNullType(inner) => {
            render_type(inner, out);
            out.push('!');
        }
    }
}

fn render_value(value: &Value<'_, String>, out: &mut String) {
    match value {
        Value::Variable(name) => {
            out.push('$');
            out.push_str(name);
        }
        Value::Int(number) => {
            out.push_str(&number.as_i64().unwrap_or_default().to_string());
        }
        Value::Float(float) => out.push_str(&float.to_string()),
        Value::String(string) => render_string(string, out),
        Value::Boolean(boolean) => out.push_str(if *boolean { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
        Value::Enum(name) => out.push_str(name),
        Value::List(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                render_value(item, out);
            }
            out.push(']');
        }
        // BTreeMap iteration gives sorted keys, so objects are already
        // order-stable.
        Value::Object(map) => {
            out.push('{');
            for (index, (key, item)) in map.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                out.push_str(key);
                out.push_str(": ");
                render_value(item, out);
            }
            out.push('}');
        }
    }
}

fn render_string(string: &str, out: &mut String) {
    out.push('"');
    for c in string.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
