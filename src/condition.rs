//! WHERE/HAVING condition assembly.
//!
//! A condition is an ordered list of SQL fragments, each carrying the
//! separator that joins it to the previous one. Fragments are compiled
//! eagerly as clauses are added; by the time a query renders, the condition
//! is just text plus the parameters already sitting in the bag.

use serde_json::Value;

use crate::compiler::Compiler;
use crate::params::ParamBag;

/// Boolean separator between adjacent fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    And,
    Or,
}

impl Separator {
    pub fn keyword(self) -> &'static str {
        match self {
            Separator::And => "AND",
            Separator::Or => "OR",
        }
    }
}

/// Comparison operators, including the value-less forms that render without
/// a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Like,
    /// Inclusive range over a two-element array value, rendered as a pair
    /// of comparisons.
    Range,
    /// Same bounds as [`Operator::Range`], rendered with the BETWEEN keyword.
    Between,
    In,
    NotIn,
    IsNull,
    NotNull,
    IsEmpty,
    NotEmpty,
}

impl Operator {
    fn symbol(self) -> Option<&'static str> {
        match self {
            Operator::Equal => Some("="),
            Operator::NotEqual => Some("<>"),
            Operator::GreaterThan => Some(">"),
            Operator::GreaterThanOrEqual => Some(">="),
            Operator::LessThan => Some("<"),
            Operator::LessThanOrEqual => Some("<="),
            Operator::Like => Some("LIKE"),
            _ => None,
        }
    }
}

/// A raw SQL fragment that bypasses column normalization.
#[derive(Debug, Clone)]
pub struct Expression(pub String);

impl Expression {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }
}

#[derive(Debug, Clone)]
struct Fragment {
    separator: Separator,
    sql: String,
}

/// Accumulated boolean expression for one clause.
#[derive(Debug, Clone, Default)]
pub struct Condition {
    fragments: Vec<Fragment>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    /// Append an already-rendered fragment.
    pub fn push(&mut self, separator: Separator, sql: impl Into<String>) {
        self.fragments.push(Fragment {
            separator,
            sql: sql.into(),
        });
    }

    /// Compile a comparison against a column, binding values as needed.
    pub fn add(
        &mut self,
        separator: Separator,
        column: &str,
        operator: Operator,
        value: Value,
        compiler: &Compiler,
        params: &mut ParamBag,
    ) {
        let sql = render(column, operator, value, compiler, params);
        self.push(separator, sql);
    }

    pub fn add_raw(&mut self, separator: Separator, expression: Expression) {
        self.push(separator, expression.0);
    }

    /// Build a parenthesized sub-group. The closure receives a scope that
    /// writes into a scratch condition; an empty group is dropped.
    pub fn add_group<F>(
        &mut self,
        separator: Separator,
        compiler: &Compiler,
        params: &mut ParamBag,
        build: F,
    ) where
        F: FnOnce(&mut ConditionScope<'_>),
    {
        let mut scope = ConditionScope {
            condition: Condition::new(),
            compiler,
            params,
        };
        build(&mut scope);
        if !scope.condition.is_empty() {
            let inner = scope.condition.compile();
            self.push(separator, format!("({inner})"));
        }
    }

    /// Join the fragments. The first fragment's separator is dropped, so a
    /// leading `AND`/`OR` never appears.
    pub fn compile(&self) -> String {
        let mut sql = String::new();
        for (i, fragment) in self.fragments.iter().enumerate() {
            if i > 0 {
                sql.push(' ');
                sql.push_str(fragment.separator.keyword());
                sql.push(' ');
            }
            sql.push_str(&fragment.sql);
        }
        sql
    }
}

/// Scratch writer handed to group closures.
pub struct ConditionScope<'a> {
    condition: Condition,
    compiler: &'a Compiler,
    params: &'a mut ParamBag,
}

impl ConditionScope<'_> {
    pub fn add(&mut self, column: &str, operator: Operator, value: Value) -> &mut Self {
        self.add_with(Separator::And, column, operator, value)
    }

    pub fn or(&mut self, column: &str, operator: Operator, value: Value) -> &mut Self {
        self.add_with(Separator::Or, column, operator, value)
    }

    pub fn add_with(
        &mut self,
        separator: Separator,
        column: &str,
        operator: Operator,
        value: Value,
    ) -> &mut Self {
        self.condition
            .add(separator, column, operator, value, self.compiler, self.params);
        self
    }

    pub fn raw(&mut self, separator: Separator, expression: Expression) -> &mut Self {
        self.condition.add_raw(separator, expression);
        self
    }

    pub fn group<F>(&mut self, separator: Separator, build: F) -> &mut Self
    where
        F: FnOnce(&mut ConditionScope<'_>),
    {
        let mut scope = ConditionScope {
            condition: Condition::new(),
            compiler: self.compiler,
            params: self.params,
        };
        build(&mut scope);
        if !scope.condition.is_empty() {
            let inner = scope.condition.compile();
            self.condition.push(separator, format!("({inner})"));
        }
        self
    }
}

fn render(
    column: &str,
    operator: Operator,
    value: Value,
    compiler: &Compiler,
    params: &mut ParamBag,
) -> String {
    let column = compiler.normalize_column(column);
    match operator {
        Operator::IsNull => format!("{column} IS NULL"),
        Operator::NotNull => format!("{column} IS NOT NULL"),
        Operator::IsEmpty => format!("({column} IS NULL OR {column} = '')"),
        Operator::NotEmpty => format!("({column} IS NOT NULL AND {column} <> '')"),
        Operator::Range | Operator::Between => {
            let bounds = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            let low = bounds.first().cloned().unwrap_or(Value::Null);
            let high = bounds.get(1).cloned().unwrap_or_else(|| low.clone());
            let low = params.bind(low);
            let high = params.bind(high);
            if operator == Operator::Range {
                format!("{column} >= {low} AND {column} <= {high}")
            } else {
                format!("{column} BETWEEN {low} AND {high}")
            }
        }
        Operator::In | Operator::NotIn => {
            let items = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            if items.is_empty() {
                // An empty list can never match (or never miss).
                return match operator {
                    Operator::In => "0 = 1".to_string(),
                    _ => "1 = 1".to_string(),
                };
            }
            let placeholders: Vec<String> =
                items.into_iter().map(|item| params.bind(item)).collect();
            let keyword = if operator == Operator::In { "IN" } else { "NOT IN" };
            format!("{column} {keyword} ({})", placeholders.join(", "))
        }
        other => {
            let symbol = other.symbol().unwrap_or("=");
            let placeholder = params.bind(value);
            format!("{column} {symbol} {placeholder}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (Compiler, ParamBag) {
        (Compiler::new("u"), ParamBag::new("u"))
    }

    #[test]
    fn first_fragment_drops_its_separator() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add(Separator::And, "a", Operator::Equal, json!(1), &compiler, &mut params);
        cond.add(Separator::Or, "b", Operator::Equal, json!(2), &compiler, &mut params);
        assert_eq!(
            cond.compile(),
            "`u`.`a` = :bind_u_0 OR `u`.`b` = :bind_u_1"
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn value_less_operators_bind_nothing() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add(Separator::And, "deleted_at", Operator::IsNull, Value::Null, &compiler, &mut params);
        cond.add(Separator::And, "email", Operator::NotEmpty, Value::Null, &compiler, &mut params);
        assert_eq!(
            cond.compile(),
            "`u`.`deleted_at` IS NULL AND (`u`.`email` IS NOT NULL AND `u`.`email` <> '')"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn is_empty_counts_null_columns_as_empty() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add(Separator::And, "email", Operator::IsEmpty, Value::Null, &compiler, &mut params);
        assert_eq!(cond.compile(), "(`u`.`email` IS NULL OR `u`.`email` = '')");
        assert!(params.is_empty());
    }

    #[test]
    fn between_binds_both_bounds() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add(
            Separator::And,
            "age",
            Operator::Between,
            json!([18, 30]),
            &compiler,
            &mut params,
        );
        assert_eq!(
            cond.compile(),
            "`u`.`age` BETWEEN :bind_u_0 AND :bind_u_1"
        );
    }

    #[test]
    fn range_renders_paired_comparisons() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add(
            Separator::And,
            "age",
            Operator::Range,
            json!([18, 30]),
            &compiler,
            &mut params,
        );
        assert_eq!(
            cond.compile(),
            "`u`.`age` >= :bind_u_0 AND `u`.`age` <= :bind_u_1"
        );
    }

    #[test]
    fn between_with_one_bound_repeats_it() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add(
            Separator::And,
            "age",
            Operator::Between,
            json!([21]),
            &compiler,
            &mut params,
        );
        assert_eq!(cond.compile(), "`u`.`age` BETWEEN :bind_u_0 AND :bind_u_1");
        assert_eq!(params.get(":bind_u_0"), params.get(":bind_u_1"));
    }

    #[test]
    fn in_list_binds_each_member() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add(
            Separator::And,
            "id",
            Operator::In,
            json!([1, 2, 3]),
            &compiler,
            &mut params,
        );
        assert_eq!(
            cond.compile(),
            "`u`.`id` IN (:bind_u_0, :bind_u_1, :bind_u_2)"
        );
    }

    #[test]
    fn empty_in_list_never_matches() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add(Separator::And, "id", Operator::In, json!([]), &compiler, &mut params);
        cond.add(Separator::And, "id", Operator::NotIn, json!([]), &compiler, &mut params);
        assert_eq!(cond.compile(), "0 = 1 AND 1 = 1");
        assert!(params.is_empty());
    }

    #[test]
    fn groups_render_parenthesized() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add(Separator::And, "status", Operator::Equal, json!("active"), &compiler, &mut params);
        cond.add_group(Separator::And, &compiler, &mut params, |scope| {
            scope
                .add("age", Operator::GreaterThan, json!(18))
                .or("vip", Operator::Equal, json!(true));
        });
        assert_eq!(
            cond.compile(),
            "`u`.`status` = :bind_u_0 AND (`u`.`age` > :bind_u_1 OR `u`.`vip` = :bind_u_2)"
        );
    }

    #[test]
    fn empty_group_is_dropped() {
        let (compiler, mut params) = setup();
        let mut cond = Condition::new();
        cond.add_group(Separator::And, &compiler, &mut params, |_| {});
        assert!(cond.is_empty());
        assert_eq!(cond.compile(), "");
    }

    #[test]
    fn raw_expressions_pass_through() {
        let (_, _) = setup();
        let mut cond = Condition::new();
        cond.add_raw(
            Separator::And,
            Expression::new("`u`.`created_at` > NOW() - INTERVAL 7 DAY"),
        );
        assert_eq!(cond.compile(), "`u`.`created_at` > NOW() - INTERVAL 7 DAY");
    }
}
