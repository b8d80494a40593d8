use promql_parser::{
    label::{MatchOp, Matcher, Matchers},
    parser::{self, Expr},
};

/// Parameters whose values are PromQL expressions or series selectors.
pub const ENFORCED_PARAMS: [&str; 3] = ["query", MATCH_PARAM, MATCH_TARGET_PARAM];
pub const MATCH_PARAM: &str = "match[]";
pub const MATCH_TARGET_PARAM: &str = "match_target";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnforceError {
    #[error("failed to parse {param}: {message}")]
    Parse { param: String, message: String },
    #[error("{param} already sets label '{label}' to a different value")]
    LabelConflict { param: String, label: String },
}

/// Pins every selector of a request to a single tenant label value.
#[derive(Debug, Clone)]
pub struct LabelEnforcer {
    label: String,
    error_on_replace: bool,
}

impl LabelEnforcer {
    pub fn new(label: &str, error_on_replace: bool) -> Self {
        Self {
            label: label.to_string(),
            error_on_replace,
        }
    }

    /// `{label="tenant"}`, used as the injected `match[]` or `match_target`
    /// selector.
    pub fn tenant_selector(&self, tenant: &str) -> String {
        format!("{{{}=\"{}\"}}", self.label, escape_label_value(tenant))
    }

    pub fn enforce_expr(&self, param: &str, input: &str, tenant: &str) -> Result<String, EnforceError> {
        let mut expr = parser::parse(input).map_err(|message| EnforceError::Parse {
            param: param.to_string(),
            message,
        })?;
        self.walk(&mut expr, param, tenant)?;
        Ok(expr.to_string())
    }

    /// Rewrites enforced parameters in place. Returns the enforced parameter
    /// names that were present.
    pub fn enforce_pairs(
        &self,
        pairs: &mut [(String, String)],
        tenant: &str,
    ) -> Result<Vec<&'static str>, EnforceError> {
        let mut seen = Vec::new();
        for (key, value) in pairs.iter_mut() {
            let Some(param) = ENFORCED_PARAMS.iter().find(|param| **param == key.as_str()) else {
                continue;
            };
            if !seen.contains(param) {
                seen.push(*param);
            }
            *value = self.enforce_expr(key, value, tenant)?;
        }
        Ok(seen)
    }

    fn walk(&self, expr: &mut Expr, param: &str, tenant: &str) -> Result<(), EnforceError> {
        match expr {
            Expr::Aggregate(aggregate) => {
                self.walk(&mut aggregate.expr, param, tenant)?;
                if let Some(inner) = aggregate.param.as_mut() {
                    self.walk(inner, param, tenant)?;
                }
                Ok(())
            }
            Expr::Unary(unary) => self.walk(&mut unary.expr, param, tenant),
            Expr::Binary(binary) => {
                self.walk(&mut binary.lhs, param, tenant)?;
                self.walk(&mut binary.rhs, param, tenant)
            }
            Expr::Paren(paren) => self.walk(&mut paren.expr, param, tenant),
            Expr::Subquery(subquery) => self.walk(&mut subquery.expr, param, tenant),
            Expr::VectorSelector(selector) => self.pin(&mut selector.matchers, param, tenant),
            Expr::MatrixSelector(matrix) => self.pin(&mut matrix.vs.matchers, param, tenant),
            Expr::Call(call) => {
                for arg in call.args.args.iter_mut() {
                    self.walk(arg, param, tenant)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn pin(&self, matchers: &mut Matchers, param: &str, tenant: &str) -> Result<(), EnforceError> {
        if matchers.or_matchers.is_empty() {
            return self.pin_group(&mut matchers.matchers, param, tenant);
        }
        for group in matchers.or_matchers.iter_mut() {
            self.pin_group(group, param, tenant)?;
        }
        Ok(())
    }

    fn pin_group(&self, group: &mut Vec<Matcher>, param: &str, tenant: &str) -> Result<(), EnforceError> {
        if self.error_on_replace {
            let conflicting = group.iter().any(|matcher| {
                matcher.name == self.label
                    && !(matches!(matcher.op, MatchOp::Equal) && matcher.value == tenant)
            });
            if conflicting {
                return Err(EnforceError::LabelConflict {
                    param: param.to_string(),
                    label: self.label.clone(),
                });
            }
        }
        group.retain(|matcher| matcher.name != self.label);
        group.push(Matcher {
            op: MatchOp::Equal,
            name: self.label.clone(),
            value: tenant.to_string(),
        });
        Ok(())
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn parse_pairs(raw: &[u8]) -> Vec<(String, String)> {
    form_urlencoded::parse(raw).into_owned().collect()
}

pub fn encode_pairs(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer() -> LabelEnforcer {
        LabelEnforcer::new("tenant_id", false)
    }

    #[test]
    fn bare_metric_gets_tenant_matcher() {
        assert_eq!(
            enforcer().enforce_expr("query", "up", "acme").unwrap(),
            r#"up{tenant_id="acme"}"#
        );
    }

    #[test]
    fn every_selector_in_expression_is_pinned() {
        let out = enforcer()
            .enforce_expr(
                "query",
                r#"sum by (job) (rate(http_requests_total{code="500"}[5m])) / on (job) group_left count(up)"#,
                "acme",
            )
            .unwrap();
        assert_eq!(out.matches(r#"tenant_id="acme""#).count(), 2);
        assert!(out.contains(r#"code="500""#));
    }

    #[test]
    fn existing_tenant_matcher_is_replaced() {
        let out = enforcer()
            .enforce_expr("query", r#"up{tenant_id=~"other|acme",job="api"}"#, "acme")
            .unwrap();
        assert!(!out.contains("other"));
        assert_eq!(out.matches("tenant_id").count(), 1);
        assert!(out.contains(r#"job="api""#));
    }

    #[test]
    fn error_on_replace_rejects_foreign_tenant_but_allows_same() {
        let strict = LabelEnforcer::new("tenant_id", true);
        assert!(matches!(
            strict.enforce_expr("query", r#"up{tenant_id="other"}"#, "acme"),
            Err(EnforceError::LabelConflict { .. })
        ));
        assert!(
            strict
                .enforce_expr("query", r#"up{tenant_id="acme"}"#, "acme")
                .is_ok()
        );
    }

    #[test]
    fn unparsable_query_is_reported() {
        assert!(matches!(
            enforcer().enforce_expr("query", "sum(", "acme"),
            Err(EnforceError::Parse { .. })
        ));
    }

    #[test]
    fn pairs_rewrite_only_enforced_params() {
        let mut pairs = parse_pairs(b"query=up&time=123&match%5B%5D=node_load1");
        let seen = enforcer().enforce_pairs(&mut pairs, "acme").unwrap();
        assert_eq!(seen, vec!["query", MATCH_PARAM]);
        assert_eq!(pairs[1], ("time".to_string(), "123".to_string()));
        assert_eq!(pairs[0].1, r#"up{tenant_id="acme"}"#);
        assert_eq!(pairs[2].1, r#"node_load1{tenant_id="acme"}"#);

        let encoded = encode_pairs(&pairs);
        assert!(encoded.starts_with("query=up%7Btenant_id%3D%22acme%22%7D&time=123"));
    }

    #[test]
    fn tenant_selector_escapes_quotes() {
        assert_eq!(
            enforcer().tenant_selector(r#"a"b"#),
            r#"{tenant_id="a\"b"}"#
        );
    }
}
