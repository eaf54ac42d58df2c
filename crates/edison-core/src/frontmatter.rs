//! YAML-frontmatter Markdown codec shared by Task and QA records.
//!
//! Format: a `---`-delimited YAML block at the top of the file, followed by
//! a free-form Markdown body. The body is preserved verbatim on save (§4.4).

use thiserror::Error;

const DELIMITER: &str = "---";

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("document does not start with a '{DELIMITER}' frontmatter delimiter")]
    MissingOpeningDelimiter,
    #[error("frontmatter block is never closed with a second '{DELIMITER}' line")]
    MissingClosingDelimiter,
    #[error("failed to parse YAML frontmatter: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Split `text` into its raw YAML frontmatter block and the trailing body.
pub fn split(text: &str) -> Result<(&str, &str), FrontmatterError> {
    let rest = text
        .strip_prefix(DELIMITER)
        .ok_or(FrontmatterError::MissingOpeningDelimiter)?;
    // Allow a newline right after the opening delimiter.
    let rest = rest.strip_prefix('\n').unwrap_or(rest);

    let closing = find_closing_delimiter(rest).ok_or(FrontmatterError::MissingClosingDelimiter)?;
    let (yaml, body) = rest.split_at(closing);
    let body = body
        .strip_prefix(DELIMITER)
        .unwrap_or(body)
        .strip_prefix('\n')
        .unwrap_or(body);
    Ok((yaml, body))
}

fn find_closing_delimiter(rest: &str) -> Option<usize> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n');
        if trimmed == DELIMITER {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

/// Parse the YAML frontmatter block into `T`, returning the raw body.
pub fn parse<T: serde::de::DeserializeOwned>(text: &str) -> Result<(T, String), FrontmatterError> {
    let (yaml, body) = split(text)?;
    let value = serde_yaml::from_str(yaml)?;
    Ok((value, body.to_owned()))
}

/// Render `frontmatter` as a YAML block followed by `body`, verbatim.
pub fn render<T: serde::Serialize>(
    frontmatter: &T,
    body: &str,
) -> Result<String, FrontmatterError> {
    let yaml = serde_yaml::to_string(frontmatter)?;
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n{body}"))
}
