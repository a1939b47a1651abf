//! Deployment diffing and the interactive confirm prompt.

use std::io::BufRead;

use owo_colors::{OwoColorize, Style};
use similar::TextDiff;

/// A unified diff between the deployed and proposed blueprints, both
/// normalized to pretty-printed JSON. Empty when they are equivalent.
pub fn diff_deployment(current: &str, proposed: &str) -> Result<String, serde_json::Error> {
    let current = pretty(current)?;
    let proposed = pretty(proposed)?;
    if current == proposed {
        return Ok(String::new());
    }
    let diff = TextDiff::from_lines(&current, &proposed);
    Ok(diff
        .unified_diff()
        .context_radius(3)
        .header("Current", "Proposed")
        .to_string())
}

fn pretty(raw: &str) -> Result<String, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    serde_json::to_string_pretty(&value)
}

/// Colourize a unified diff: removed lines red, added lines green, each
/// followed by a reset so surrounding output keeps its own colours.
pub fn colorize_diff(diff: &str) -> String {
    let red = Style::new().red();
    let green = Style::new().green();

    let mut out = String::new();
    for line in diff.split_inclusive('\n') {
        if line.starts_with('+') {
            out.push_str(&line.style(green).to_string());
        } else if line.starts_with('-') {
            out.push_str(&line.style(red).to_string());
        } else {
            out.push_str(line);
        }
    }
    out
}

/// Ask for a yes/no answer, re-prompting on anything else. EOF declines.
pub fn confirm(input: &mut dyn BufRead, prompt: &str) -> std::io::Result<bool> {
    loop {
        eprint!("{prompt} [y/n]: ");
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_deployments_have_no_diff() {
        assert_eq!(diff_deployment("{}", "{}").unwrap(), "");
        assert_eq!(
            diff_deployment(
                r#"{"Machines":[{"Provider":"Amazon"}]}"#,
                r#"{"Machines": [{"Provider": "Amazon"}]}"#,
            )
            .unwrap(),
            ""
        );
    }

    #[test]
    fn diff_carries_the_deployment_headers() {
        let diff = diff_deployment(
            r#"{"Machines":[{"Provider":"Amazon"}]}"#,
            r#"{"Machines":[]}"#,
        )
        .unwrap();
        assert!(diff.starts_with("--- Current\n+++ Proposed\n"));
        assert!(diff.contains("-      \"Provider\": \"Amazon\""));
        assert!(diff.contains("+  \"Machines\": []"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(diff_deployment("{", "{}").is_err());
        assert!(diff_deployment("{}", "{").is_err());
    }

    #[test]
    fn colorize_wraps_changed_lines() {
        let red = Style::new().red();
        let green = Style::new().green();

        let colorized = colorize_diff("no color\n-\tred\n+\tgreen\n");
        let expected = format!(
            "no color\n{}{}",
            "-\tred\n".style(red),
            "+\tgreen\n".style(green),
        );
        assert_eq!(colorized, expected);

        // Removed lines start with the red escape; every coloured line is
        // reset-terminated.
        assert!(colorized.contains("\x1b[31m-\tred\n"));
        assert!(colorized.contains("\x1b[32m+\tgreen\n"));
        assert_eq!(colorized.matches("\x1b[0m").count(), 2);
    }

    #[test]
    fn colorize_leaves_plain_text_alone() {
        assert_eq!(colorize_diff("{}"), "{}");
        assert_eq!(colorize_diff("\n"), "\n");
        assert_eq!(colorize_diff("\na\n\n"), "\na\n\n");
    }

    #[test]
    fn colorize_treats_table_borders_as_additions() {
        let green = Style::new().green();
        assert_eq!(
            colorize_diff("+----+---+\n"),
            format!("{}", "+----+---+\n".style(green))
        );
    }

    #[test]
    fn confirm_accepts_and_declines() {
        let cases: &[(&str, bool)] = &[
            ("y\n", true),
            ("yes\n", true),
            ("YES\n", true),
            ("n\n", false),
            ("no\n", false),
            ("foo\nno\n", false),
            ("foo\nno\nyes\n", false),
            ("", false),
        ];
        for (input, expected) in cases {
            let mut reader = std::io::Cursor::new(input.as_bytes());
            assert_eq!(
                confirm(&mut reader, "").unwrap(),
                *expected,
                "input {input:?}"
            );
        }
    }
}
