//! Pre-flight checks of filename rules.
use std::fmt::Display;

use super::{FilenameBuilder, FilenameRules, Template};
use crate::filter::FilterExpression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFs {
    Windows,
    Unix,
}

impl TargetFs {
    /// Filesystem of the running platform.
    pub const fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    /// Characters a template literal can't contain. `/` is always the directory separator.
    const fn forbidden(&self) -> &'static [char] {
        match self {
            Self::Windows => &['\\', ':', '*', '?', '"', '<', '>', '|', '\0'],
            Self::Unix => &['\0'],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Template the issue was found in
    pub template: String,
    pub message: String,
}

impl Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{} in '{}': {}", level, self.template, self.message)
    }
}

fn check_template(raw: &str, fs: TargetFs, issues: &mut Vec<ValidationIssue>) {
    let mut push = |severity, message: String| {
        issues.push(ValidationIssue {
            severity,
            template: raw.to_string(),
            message,
        });
    };

    let template = match Template::parse(raw) {
        Ok(template) => template,
        Err(e) => {
            push(Severity::Error, e.to_string());
            return;
        }
    };

    for literal in template.literals() {
        if let Some(c) = literal.chars().find(|c| fs.forbidden().contains(c)) {
            push(
                Severity::Error,
                format!("character '{}' is not allowed in filenames", c),
            );
        }
    }

    if template.is_script() {
        // Dry run against a record with every field set
        let sample = FilenameRules {
            template: raw.to_string(),
            ..Default::default()
        };
        if let (Ok(builder), Some(record)) = (FilenameBuilder::new(&sample), sample_record()) {
            if let Err(e) = builder.resolve(&record, &[]) {
                push(Severity::Error, e.to_string());
            }
        }
    } else if !template.uses("ext") {
        push(Severity::Warning, "filename has no %ext% token".to_string());
    }

    if !template.uses("md5") {
        push(
            Severity::Warning,
            "filenames without %md5% might not be unique".to_string(),
        );
    }
}

fn sample_record() -> Option<crate::record::ImageRecord> {
    use crate::record::{tags::Tag, tags::TagType, ImageRecord, RecordDraft};

    let mut draft = RecordDraft::new();
    for (k, v) in [
        ("id", "1"),
        ("md5", "d41d8cd98f00b204e9800998ecf8427e"),
        ("ext", "jpg"),
        ("rating", "s"),
        ("score", "1"),
        ("author", "author"),
        ("created_at", "2020-01-01T00:00:00Z"),
        ("width", "1"),
        ("height", "1"),
        ("file_size", "1"),
    ] {
        draft.set(k, v);
    }
    for t in TagType::NAMED {
        draft.push_tag(Tag::new(t.name(), t));
    }
    ImageRecord::from_draft("site", "https://localhost", draft).ok()
}

/// Checks every template and condition of `rules`. An empty result means all is fine.
pub fn validate(rules: &FilenameRules, fs: TargetFs) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    check_template(&rules.template, fs, &mut issues);
    for rule in &rules.conditions {
        if let Err(e) = FilterExpression::parse(&rule.condition) {
            issues.push(ValidationIssue {
                severity: Severity::Error,
                template: rule.condition.clone(),
                message: e.to_string(),
            });
        }
        check_template(&rule.template, fs, &mut issues);
    }
    issues
}

/// Whether any issue prevents the rules from being used.
pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|i| i.severity == Severity::Error)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filename::ConditionalRule;

    fn check(template: &str, fs: TargetFs) -> Vec<ValidationIssue> {
        validate(
            &FilenameRules {
                template: template.into(),
                ..Default::default()
            },
            fs,
        )
    }

    #[test]
    fn good_template_is_clean() {
        assert!(check("%artist%/%md5%.%ext%", TargetFs::Windows).is_empty());
    }

    #[test]
    fn empty_and_forbidden() {
        let issues = check("", TargetFs::Unix);
        assert!(has_errors(&issues));
        assert_eq!(issues[0].message, "Filename template is empty");

        let issues = check("%md5%?.%ext%", TargetFs::Windows);
        assert!(has_errors(&issues));
        assert!(!has_errors(&check("%md5%?.%ext%", TargetFs::Unix)));
    }

    #[test]
    fn warnings() {
        let issues = check("%id%", TargetFs::Unix);
        assert_eq!(issues.len(), 2);
        assert!(!has_errors(&issues));
        assert!(issues.iter().all(|i| i.severity == Severity::Warning));
    }

    #[test]
    fn scripts_are_dry_run() {
        assert!(has_errors(&check("expr:missing_field + ext", TargetFs::Unix)));
        assert!(has_errors(&check("expr:(", TargetFs::Unix)));
        let issues = check(r#"expr:md5 + "." + ext"#, TargetFs::Unix);
        assert!(issues.is_empty(), "{:?}", issues);
    }

    #[test]
    fn conditions_are_checked() {
        let rules = FilenameRules {
            conditions: vec![ConditionalRule {
                condition: "score:abc".into(),
                template: "%md5%.%ext%".into(),
            }],
            ..Default::default()
        };
        let issues = validate(&rules, TargetFs::Unix);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].template, "score:abc");
    }
}
