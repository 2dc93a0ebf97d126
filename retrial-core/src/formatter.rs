//! Display names of parameterized invocations.
//!
//! A pattern may contain the following placeholders:
//!
//! | placeholder            | replaced with                                  |
//! |------------------------|------------------------------------------------|
//! | `{displayName}`        | display name of the test                       |
//! | `{index}`              | 1-based index of the argument set              |
//! | `{arguments}`          | all arguments, comma separated                 |
//! | `{argumentsWithNames}` | all arguments as `name=value` when names exist |
//! | `{0}`, `{1}`, ...      | a single argument                              |

use itertools::Itertools;
use serde_json::Value;

use crate::{invocation::Arguments, retry::ConfigurationError};

pub const DEFAULT_PATTERN: &str = "[{index}] {argumentsWithNames}";
pub const DEFAULT_ARGUMENT_MAX_LENGTH: usize = 512;

const DISPLAY_NAME_PLACEHOLDER: &str = "{displayName}";
const INDEX_PLACEHOLDER: &str = "{index}";
const ARGUMENTS_PLACEHOLDER: &str = "{arguments}";
const ARGUMENTS_WITH_NAMES_PLACEHOLDER: &str = "{argumentsWithNames}";
const ELLIPSIS: char = '\u{2026}';

#[derive(Debug, Clone)]
pub struct NameFormatter {
    pattern: String,
    display_name: String,
    parameter_names: Vec<String>,
    argument_max_length: usize,
}

impl NameFormatter {
    /// Fails when `pattern` is blank.
    pub fn new(
        pattern: &str,
        display_name: impl Into<String>,
    ) -> Result<NameFormatter, ConfigurationError> {
        let display_name = display_name.into();
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(ConfigurationError::new(format!(
                "parameterized test \"{display_name}\" must be declared with a non-empty name pattern"
            )));
        }

        Ok(NameFormatter {
            pattern: pattern.to_string(),
            display_name,
            parameter_names: Vec::new(),
            argument_max_length: DEFAULT_ARGUMENT_MAX_LENGTH,
        })
    }

    /// Names used by `{argumentsWithNames}`, by position.
    pub fn with_parameter_names<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> NameFormatter {
        self.parameter_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_argument_max_length(mut self, argument_max_length: usize) -> NameFormatter {
        self.argument_max_length = argument_max_length;
        self
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn format(&self, index: usize, arguments: &Arguments) -> String {
        let count = arguments.len();
        let mut template = self
            .pattern
            .replace(DISPLAY_NAME_PLACEHOLDER, &self.display_name)
            .replace(INDEX_PLACEHOLDER, &index.to_string());

        if template.contains(ARGUMENTS_WITH_NAMES_PLACEHOLDER) {
            let with_names = (0..count)
                .map(|i| match self.parameter_names.get(i) {
                    Some(name) => format!("{name}={{{i}}}"),
                    None => format!("{{{i}}}"),
                })
                .join(", ");
            template = template.replace(ARGUMENTS_WITH_NAMES_PLACEHOLDER, &with_names);
        }

        if template.contains(ARGUMENTS_PLACEHOLDER) {
            let positional = (0..count).map(|i| format!("{{{i}}}")).join(", ");
            template = template.replace(ARGUMENTS_PLACEHOLDER, &positional);
        }

        let readable: Vec<_> = arguments
            .values()
            .iter()
            .map(|value| self.readable(value))
            .collect();

        substitute(&template, &readable)
    }

    fn readable(&self, value: &Value) -> String {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        if text.chars().count() > self.argument_max_length {
            let mut truncated: String = text
                .chars()
                .take(self.argument_max_length.saturating_sub(1))
                .collect();
            truncated.push(ELLIPSIS);
            truncated
        } else {
            text
        }
    }
}

/// Replace `{N}` with the N-th readable argument in a single pass. Unknown
/// indices stay as they are.
fn substitute(template: &str, readable: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let argument = after.find('}').and_then(|close| {
            let digits = &after[..close];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let value = readable.get(digits.parse::<usize>().ok()?)?;
            Some((value, close))
        });

        match argument {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    fn arguments() -> Arguments {
        Arguments::new(vec![json!(10), json!("abc"), json!(true)])
    }

    #[test]
    fn default_pattern_without_names() {
        let formatter = NameFormatter::new(DEFAULT_PATTERN, "add").unwrap();
        assert_eq!(formatter.format(1, &arguments()), "[1] 10, abc, true");
    }

    #[test]
    fn default_pattern_with_names() {
        let formatter = NameFormatter::new(DEFAULT_PATTERN, "add")
            .unwrap()
            .with_parameter_names(["a", "b"]);
        assert_eq!(formatter.format(2, &arguments()), "[2] a=10, b=abc, true");
    }

    #[test_case("{displayName} #{index}", "sum #3"; "display name and index")]
    #[test_case("{arguments}", "10, abc, true"; "arguments")]
    #[test_case("{1} then {0}", "abc then 10"; "positional")]
    #[test_case("{5} {x} {}", "{5} {x} {}"; "unknown placeholders")]
    #[test_case("  {0}  ", "10"; "trimmed")]
    fn format(pattern: &str, expected: &str) {
        let formatter = NameFormatter::new(pattern, "sum").unwrap();
        assert_eq!(formatter.format(3, &arguments()), expected);
    }

    #[test]
    fn argument_values_are_not_rescanned() {
        let formatter = NameFormatter::new("{0}-{1}", "t").unwrap();
        let arguments = Arguments::new(vec![json!("{1}"), json!("x")]);
        assert_eq!(formatter.format(1, &arguments), "{1}-x");
    }

    #[test]
    fn long_arguments_are_truncated() {
        let formatter = NameFormatter::new("{0}", "t")
            .unwrap()
            .with_argument_max_length(5);
        let arguments = Arguments::new(vec![json!("abcdefgh")]);
        assert_eq!(formatter.format(1, &arguments), "abcd\u{2026}");

        let arguments = Arguments::new(vec![json!("abcde")]);
        assert_eq!(formatter.format(1, &arguments), "abcde");
    }

    #[test_case(""; "empty")]
    #[test_case("   "; "blank")]
    fn blank_pattern_is_a_configuration_error(pattern: &str) {
        let err = NameFormatter::new(pattern, "t").unwrap_err();
        assert!(err.to_string().contains("non-empty name pattern"));
    }
}
