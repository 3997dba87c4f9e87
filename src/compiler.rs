//! SQL fragment compilation.
//!
//! Pure string transforms from column expressions, aliases, and clause state
//! to SQL text. The compiler carries nothing but the alias of the model it
//! serves; everything else is input.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::condition::Condition;

/// Sort direction for ORDER BY entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    Asc,
    Desc,
}

impl Sort {
    pub fn keyword(self) -> &'static str {
        match self {
            Sort::Asc => "ASC",
            Sort::Desc => "DESC",
        }
    }
}

static FUNC_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9_]+)\(([A-Za-z0-9_.`\x22*]+)\)$").expect("valid regex"));

static QUOTED_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`([A-Za-z0-9_]+)`").expect("valid regex"));

/// Quote one identifier segment. The wildcard passes through; existing
/// quoting is stripped before re-wrapping so the function is idempotent.
pub fn quote(identifier: &str) -> String {
    if identifier == "*" {
        return identifier.to_string();
    }
    let trimmed = identifier.trim_matches(|c| c == '`' || c == '"');
    format!("`{trimmed}`")
}

fn is_numeric(expr: &str) -> bool {
    !expr.is_empty() && expr.parse::<f64>().is_ok()
}

/// Strip anything that is not an identifier character. Applied to each
/// dot-separated segment before quoting so stray characters cannot smuggle
/// SQL through a column position.
fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '*')
        .collect()
}

/// Compiles column references against one model alias.
#[derive(Debug, Clone)]
pub struct Compiler {
    alias: String,
}

impl Compiler {
    pub fn new(alias: impl Into<String>) -> Self {
        Self { alias: alias.into() }
    }

    /// Qualify and quote a column expression.
    ///
    /// Numeric expressions pass through as literals. A single-argument call
    /// `name(arg)` has only its argument qualified; any other call-shaped
    /// expression passes through untouched. A bare column is prefixed with
    /// the current alias unless it is the wildcard.
    pub fn normalize_column(&self, column: &str) -> String {
        let column = column.trim();
        if is_numeric(column) {
            return column.to_string();
        }
        if let Some(caps) = FUNC_CALL.captures(column) {
            return format!("{}({})", &caps[1], self.qualify(&caps[2]));
        }
        if column.contains('(') {
            return column.to_string();
        }
        self.qualify(column)
    }

    fn qualify(&self, expr: &str) -> String {
        let mut parts: Vec<String> = expr.split('.').map(sanitize_segment).collect();
        if parts.len() == 1 && parts[0] != "*" {
            parts.insert(0, self.alias.clone());
        }
        parts
            .iter()
            .map(|p| quote(p))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Render the select list. An empty list selects everything under the
    /// current alias; aggregate expressions are hoisted to the front and
    /// duplicates removed.
    pub fn build_selected_column(&self, selects: &[(String, String)]) -> String {
        if selects.is_empty() {
            return format!("{}.*", quote(&self.alias));
        }
        let mut rendered: Vec<String> = Vec::new();
        for (alias, expr) in selects {
            let mine = if expr.contains('*') && !expr.contains('(') {
                expr.clone()
            } else if alias == expr {
                expr.clone()
            } else {
                format!("{expr} AS {alias}")
            };
            if mine.contains('(') {
                rendered.insert(0, mine);
            } else {
                rendered.push(mine);
            }
        }
        let mut seen = std::collections::HashSet::new();
        rendered.retain(|entry| seen.insert(entry.clone()));
        rendered.join(", ")
    }

    pub fn build_group_by(&self, groups: &[String]) -> String {
        groups.join(", ")
    }

    pub fn build_order_by(&self, orders: &[(String, Sort)]) -> String {
        orders
            .iter()
            .map(|(column, sort)| format!("{} {}", column, sort.keyword()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Join accumulated condition fragments into one boolean expression.
    pub fn build_condition(&self, condition: &Condition) -> String {
        condition.compile()
    }
}

/// Derive a deterministic alias for a column expression.
///
/// Numeric expressions pass through. Otherwise the last quoted identifier
/// is extracted when present, or the expression is reduced to identifier
/// characters. With a `prefix`, a trailing `_id` or leading `id_` is
/// stripped from the extracted name before prepending, producing names like
/// `pivot_relation_role` for `role_id`.
pub fn make_column_alias(column: &str, prefix: Option<&str>) -> String {
    if is_numeric(column) {
        return column.to_string();
    }
    let name = match QUOTED_IDENT.captures_iter(column).last() {
        Some(caps) => caps[1].to_string(),
        None => column
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
            .collect(),
    };
    match prefix {
        Some(prefix) => {
            let base = name
                .strip_suffix("_id")
                .or_else(|| name.strip_prefix("id_"))
                .unwrap_or(&name);
            quote(&format!("{prefix}_{base}"))
        }
        None => quote(&name),
    }
}
