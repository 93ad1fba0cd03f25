//! Row restriction compilation.
//!
//! Translates the subset of DataFusion filter expressions that the warehouse
//! can evaluate into standard SQL, and combines them with a filter configured
//! on the read.

use chrono::DateTime;
use datafusion::logical_expr::expr::{Between, BinaryExpr, InList, Like};
use datafusion::logical_expr::{Expr, Operator};
use datafusion::scalar::ScalarValue;

fn sanitize_sql_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn sanitize_sql_identifier(s: &str) -> String {
    s.replace('\\', "\\\\").replace('`', "\\`")
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", sanitize_sql_identifier(name))
}

/// SQL for `expr`, or `None` if any part of it cannot be evaluated
/// server-side. A `None` filter is still applied by the engine.
pub fn compile_filter(expr: &Expr) -> Option<String> {
    match expr {
        Expr::BinaryExpr(BinaryExpr { left, op, right }) => match op {
            Operator::And | Operator::Or => {
                let l = compile_filter(left)?;
                let r = compile_filter(right)?;
                Some(format!("({}) {} ({})", l, op, r))
            }
            Operator::Eq
            | Operator::NotEq
            | Operator::Lt
            | Operator::LtEq
            | Operator::Gt
            | Operator::GtEq => {
                let l = compile_operand(left)?;
                let r = compile_operand(right)?;
                Some(format!("{} {} {}", l, comparison(op), r))
            }
            _ => None,
        },
        Expr::Not(inner) => compile_filter(inner).map(|f| format!("NOT ({})", f)),
        Expr::IsNull(inner) => compile_column(inner).map(|c| format!("{} IS NULL", c)),
        Expr::IsNotNull(inner) => compile_column(inner).map(|c| format!("{} IS NOT NULL", c)),
        Expr::InList(InList {
            expr,
            list,
            negated,
        }) => {
            if list.is_empty() {
                return None;
            }
            let col = compile_column(expr)?;
            let values = list
                .iter()
                .map(compile_literal)
                .collect::<Option<Vec<_>>>()?;
            Some(format!(
                "{}{} IN ({})",
                col,
                if *negated { " NOT" } else { "" },
                values.join(", ")
            ))
        }
        Expr::Between(Between {
            expr,
            negated,
            low,
            high,
        }) => {
            let col = compile_column(expr)?;
            Some(format!(
                "{}{} BETWEEN {} AND {}",
                col,
                if *negated { " NOT" } else { "" },
                compile_literal(low)?,
                compile_literal(high)?
            ))
        }
        Expr::Like(Like {
            negated,
            expr,
            pattern,
            escape_char,
            case_insensitive,
        }) => {
            // The warehouse has neither ILIKE nor a custom escape character.
            if *case_insensitive || escape_char.is_some() {
                return None;
            }
            let col = compile_column(expr)?;
            Some(format!(
                "{}{} LIKE {}",
                col,
                if *negated { " NOT" } else { "" },
                compile_literal(pattern)?
            ))
        }
        _ => None,
    }
}

fn comparison(op: &Operator) -> &'static str {
    match op {
        Operator::Eq => "=",
        Operator::NotEq => "!=",
        Operator::Lt => "<",
        Operator::LtEq => "<=",
        Operator::Gt => ">",
        _ => ">=",
    }
}

fn compile_operand(expr: &Expr) -> Option<String> {
    compile_column(expr).or_else(|| compile_literal(expr))
}

fn compile_column(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Column(c) => Some(quote_identifier(&c.name)),
        _ => None,
    }
}

fn compile_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Literal(value) => format_literal(value),
        _ => None,
    }
}

fn format_literal(value: &ScalarValue) -> Option<String> {
    match value {
        ScalarValue::Boolean(Some(b)) => Some(if *b { "TRUE" } else { "FALSE" }.to_string()),
        ScalarValue::Int8(Some(v)) => Some(v.to_string()),
        ScalarValue::Int16(Some(v)) => Some(v.to_string()),
        ScalarValue::Int32(Some(v)) => Some(v.to_string()),
        ScalarValue::Int64(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt8(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt16(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt32(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt64(Some(v)) => Some(v.to_string()),
        ScalarValue::Float32(Some(v)) => format_float(f64::from(*v)),
        ScalarValue::Float64(Some(v)) => format_float(*v),
        ScalarValue::Decimal128(Some(v), _, scale) => {
            Some(format!("NUMERIC '{}'", format_decimal(&v.to_string(), *scale)))
        }
        ScalarValue::Decimal256(Some(v), _, scale) => Some(format!(
            "BIGNUMERIC '{}'",
            format_decimal(&v.to_string(), *scale)
        )),
        ScalarValue::Utf8(Some(s))
        | ScalarValue::LargeUtf8(Some(s))
        | ScalarValue::Utf8View(Some(s)) => Some(format!("'{}'", sanitize_sql_string(s))),
        ScalarValue::Date32(Some(days)) => {
            let date = DateTime::from_timestamp(i64::from(*days) * 86_400, 0)?.date_naive();
            Some(format!("DATE '{}'", date.format("%Y-%m-%d")))
        }
        ScalarValue::TimestampMicrosecond(Some(us), tz) => {
            let ts = DateTime::from_timestamp_micros(*us)?;
            match tz {
                Some(_) => Some(format!(
                    "TIMESTAMP '{}'",
                    ts.format("%Y-%m-%d %H:%M:%S%.6f UTC")
                )),
                None => Some(format!(
                    "DATETIME '{}'",
                    ts.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f")
                )),
            }
        }
        _ => None,
    }
}

fn format_float(v: f64) -> Option<String> {
    if !v.is_finite() {
        return None;
    }
    if v == v.floor() && v.abs() < 1e15 {
        Some(format!("{}", v as i64))
    } else {
        Some(format!("{}", v))
    }
}

/// Insert the decimal point into an unscaled integer rendering.
fn format_decimal(unscaled: &str, scale: i8) -> String {
    if scale <= 0 {
        return format!("{}{}", unscaled, "0".repeat(scale.unsigned_abs() as usize));
    }
    let (sign, digits) = match unscaled.strip_prefix('-') {
        Some(d) => ("-", d),
        None => ("", unscaled),
    };
    let scale = scale as usize;
    let padded = if digits.len() <= scale {
        format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
    } else {
        digits.to_string()
    };
    let (int, frac) = padded.split_at(padded.len() - scale);
    format!("{}{}.{}", sign, int, frac)
}

/// Combine the configured filter with the filters pushed down by the engine.
///
/// With `combine`, every non-empty filter is parenthesized and joined with
/// `AND`, pushed filters first. Without it the configured filter replaces
/// the pushed ones, which then only apply when nothing is configured.
pub fn combine_filters(configured: Option<&str>, pushed: &[String], combine: bool) -> Option<String> {
    let configured = configured.map(str::trim).filter(|f| !f.is_empty());
    let pushed: Vec<&str> = pushed
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect();

    let parts: Vec<&str> = if combine {
        pushed.into_iter().chain(configured).collect()
    } else if let Some(configured) = configured {
        vec![configured]
    } else {
        pushed
    };

    match parts.as_slice() {
        [] => None,
        [only] => Some(only.to_string()),
        many => Some(
            many.iter()
                .map(|f| format!("({})", f))
                .collect::<Vec<_>>()
                .join(" AND "),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Not;

    use datafusion::common::Column;
    use datafusion::prelude::{col, lit};

    // --- Comparison tests ---
    #[test]
    fn test_eq_string_to_sql() {
        let sql = compile_filter(&col("status").eq(lit("active"))).unwrap();
        assert_eq!(sql, "`status` = 'active'");
    }

    #[test]
    fn test_eq_number_to_sql() {
        let sql = compile_filter(&col("word_count").eq(lit(4i64))).unwrap();
        assert_eq!(sql, "`word_count` = 4");
    }

    #[test]
    fn test_float_number_to_sql() {
        assert_eq!(
            compile_filter(&col("price").lt_eq(lit(19.99f64))).unwrap(),
            "`price` <= 19.99"
        );
        assert_eq!(
            compile_filter(&col("price").gt(lit(100.0f64))).unwrap(),
            "`price` > 100"
        );
    }

    #[test]
    fn test_neq_and_ordering_ops() {
        assert_eq!(compile_filter(&col("id").not_eq(lit(0i32))).unwrap(), "`id` != 0");
        assert_eq!(compile_filter(&col("id").lt(lit(5i32))).unwrap(), "`id` < 5");
        assert_eq!(compile_filter(&col("id").gt_eq(lit(5i32))).unwrap(), "`id` >= 5");
    }

    #[test]
    fn test_literal_on_left() {
        assert_eq!(compile_filter(&lit(5i64).lt(col("n"))).unwrap(), "5 < `n`");
    }

    #[test]
    fn test_nan_not_pushed() {
        assert!(compile_filter(&col("x").eq(lit(f64::NAN))).is_none());
    }

    #[test]
    fn test_null_literal_not_pushed() {
        assert!(compile_filter(&col("x").eq(lit(ScalarValue::Utf8(None)))).is_none());
    }

    // --- Typed literals ---
    #[test]
    fn test_boolean_literal() {
        assert_eq!(compile_filter(&col("ok").eq(lit(true))).unwrap(), "`ok` = TRUE");
    }

    #[test]
    fn test_date_literal() {
        let expr = col("d").gt_eq(lit(ScalarValue::Date32(Some(19723))));
        assert_eq!(compile_filter(&expr).unwrap(), "`d` >= DATE '2024-01-01'");
    }

    #[test]
    fn test_timestamp_literals() {
        let us = 1_704_067_200_000_000i64;
        let ts = lit(ScalarValue::TimestampMicrosecond(Some(us), Some("UTC".into())));
        assert_eq!(
            compile_filter(&col("t").lt(ts)).unwrap(),
            "`t` < TIMESTAMP '2024-01-01 00:00:00.000000 UTC'"
        );
        let dt = lit(ScalarValue::TimestampMicrosecond(Some(us + 1), None));
        assert_eq!(
            compile_filter(&col("t").lt(dt)).unwrap(),
            "`t` < DATETIME '2024-01-01T00:00:00.000001'"
        );
    }

    #[test]
    fn test_decimal_literal() {
        let expr = col("amount").gt(lit(ScalarValue::Decimal128(Some(-12345), 10, 2)));
        assert_eq!(compile_filter(&expr).unwrap(), "`amount` > NUMERIC '-123.45'");
        assert_eq!(format_decimal("5", 3), "0.005");
        assert_eq!(format_decimal("12", -2), "1200");
    }

    // --- Boolean combinators ---
    #[test]
    fn test_and_or_not() {
        let expr = col("a").eq(lit(1i64)).and(col("b").eq(lit("x")).or(col("c").is_null()));
        assert_eq!(
            compile_filter(&expr).unwrap(),
            "(`a` = 1) AND ((`b` = 'x') OR (`c` IS NULL))"
        );
        let expr = col("a").eq(lit(1i64)).not();
        assert_eq!(compile_filter(&expr).unwrap(), "NOT (`a` = 1)");
    }

    #[test]
    fn test_and_with_unsupported_side_not_pushed() {
        let expr = col("a").eq(lit(1i64)).and(col("b").eq(col("c") + lit(1i64)));
        assert!(compile_filter(&expr).is_none());
    }

    #[test]
    fn test_is_not_null() {
        assert_eq!(
            compile_filter(&col("name").is_not_null()).unwrap(),
            "`name` IS NOT NULL"
        );
    }

    // --- In / Between / Like ---
    #[test]
    fn test_in_to_sql() {
        let expr = col("category").in_list(vec![lit("food"), lit("drink")], false);
        assert_eq!(
            compile_filter(&expr).unwrap(),
            "`category` IN ('food', 'drink')"
        );
        let expr = col("n").in_list(vec![lit(1i64)], true);
        assert_eq!(compile_filter(&expr).unwrap(), "`n` NOT IN (1)");
    }

    #[test]
    fn test_in_empty_list_not_pushed() {
        assert!(compile_filter(&col("n").in_list(vec![], false)).is_none());
    }

    #[test]
    fn test_between_to_sql() {
        let expr = col("invoice_date").between(lit("2024-01-01"), lit("2024-01-31"));
        assert_eq!(
            compile_filter(&expr).unwrap(),
            "`invoice_date` BETWEEN '2024-01-01' AND '2024-01-31'"
        );
        let expr = col("n").not_between(lit(1i64), lit(9i64));
        assert_eq!(compile_filter(&expr).unwrap(), "`n` NOT BETWEEN 1 AND 9");
    }

    #[test]
    fn test_like_to_sql() {
        assert_eq!(
            compile_filter(&col("name").like(lit("%acme%"))).unwrap(),
            "`name` LIKE '%acme%'"
        );
        assert_eq!(
            compile_filter(&col("name").not_like(lit("a_"))).unwrap(),
            "`name` NOT LIKE 'a_'"
        );
        assert!(compile_filter(&col("name").ilike(lit("%a%"))).is_none());
    }

    // --- SQL injection prevention ---
    #[test]
    fn test_sql_injection_single_quote_escaped() {
        let sql = compile_filter(&col("name").eq(lit("O'Brien"))).unwrap();
        assert_eq!(sql, "`name` = 'O\\'Brien'");
    }

    #[test]
    fn test_sql_injection_drop_table() {
        let sql = compile_filter(&col("name").eq(lit("'; DROP TABLE users; --"))).unwrap();
        assert_eq!(sql, "`name` = '\\'; DROP TABLE users; --'");
    }

    #[test]
    fn test_sql_injection_trailing_backslash() {
        let sql = compile_filter(&col("name").eq(lit("abc\\"))).unwrap();
        assert_eq!(sql, "`name` = 'abc\\\\'");
    }

    #[test]
    fn test_sql_injection_in_column_name() {
        let column = Expr::Column(Column::new_unqualified("a` OR 1=1 --"));
        let sql = compile_filter(&column.eq(lit(1i64))).unwrap();
        assert_eq!(sql, "`a\\` OR 1=1 --` = 1");
    }

    #[test]
    fn test_sql_injection_in_list_values() {
        let expr = col("c").in_list(vec![lit("ok"), lit("x') OR ('1'='1")], false);
        assert_eq!(
            compile_filter(&expr).unwrap(),
            "`c` IN ('ok', 'x\\') OR (\\'1\\'=\\'1')"
        );
    }

    // --- Unsupported expressions ---
    #[test]
    fn test_column_comparison_and_arithmetic() {
        assert_eq!(compile_filter(&col("a").eq(col("b"))).unwrap(), "`a` = `b`");
        assert!(compile_filter(&(col("a") + lit(1i64)).gt(lit(2i64))).is_none());
    }

    #[test]
    fn test_bare_column_not_pushed() {
        assert!(compile_filter(&col("flag")).is_none());
    }

    // --- Filter combination ---
    fn pushed(filters: &[&str]) -> Vec<String> {
        filters.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_combine_nothing() {
        for combine in [true, false] {
            assert_eq!(combine_filters(None, &[], combine), None);
            assert_eq!(combine_filters(Some("  "), &pushed(&["", " "]), combine), None);
        }
    }

    #[test]
    fn test_combine_single_filter_unwrapped() {
        for combine in [true, false] {
            assert_eq!(
                combine_filters(Some("a = 1"), &[], combine).as_deref(),
                Some("a = 1")
            );
            assert_eq!(
                combine_filters(None, &pushed(&["b = 2"]), combine).as_deref(),
                Some("b = 2")
            );
        }
    }

    #[test]
    fn test_combine_pushed_then_configured() {
        assert_eq!(
            combine_filters(Some("c = 3"), &pushed(&["a = 1", "b = 2"]), true).as_deref(),
            Some("(a = 1) AND (b = 2) AND (c = 3)")
        );
    }

    #[test]
    fn test_combine_skips_empty_pushed() {
        assert_eq!(
            combine_filters(Some("c = 3"), &pushed(&["", "b = 2"]), true).as_deref(),
            Some("(b = 2) AND (c = 3)")
        );
    }

    #[test]
    fn test_no_combine_configured_wins() {
        assert_eq!(
            combine_filters(Some("c = 3"), &pushed(&["a = 1", "b = 2"]), false).as_deref(),
            Some("c = 3")
        );
    }

    #[test]
    fn test_no_combine_falls_back_to_pushed() {
        assert_eq!(
            combine_filters(None, &pushed(&["a = 1", "b = 2"]), false).as_deref(),
            Some("(a = 1) AND (b = 2)")
        );
    }

    #[test]
    fn test_combine_exhaustive() {
        let configured_cases = [None, Some(""), Some("cfg")];
        let pushed_cases = [vec![], pushed(&["p1"]), pushed(&["p1", "p2"])];
        for configured in configured_cases {
            for p in &pushed_cases {
                for combine in [true, false] {
                    let result = combine_filters(configured, p, combine);
                    let has_cfg = matches!(configured, Some(c) if !c.is_empty());
                    let expected_parts: Vec<&str> = if combine {
                        p.iter().map(String::as_str).chain(configured.filter(|_| has_cfg)).collect()
                    } else if has_cfg {
                        vec!["cfg"]
                    } else {
                        p.iter().map(String::as_str).collect()
                    };
                    match expected_parts.len() {
                        0 => assert_eq!(result, None),
                        1 => assert_eq!(result.as_deref(), Some(expected_parts[0])),
                        _ => {
                            let result = result.unwrap();
                            for part in &expected_parts {
                                assert!(result.contains(&format!("({})", part)));
                            }
                            assert_eq!(
                                result.matches(" AND ").count(),
                                expected_parts.len() - 1
                            );
                        }
                    }
                }
            }
        }
    }
}
