use crate::error::{Result, RhizomeError};
use crate::types::Frontmatter;
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

fn markdown_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_HEADING_ATTRIBUTES);
    options
}

/// Markdown to HTML. Fenced code keeps its language as a `language-*` class so a
/// client-side highlighter can pick it up.
pub fn parse_markdown(content: &str) -> String {
    let parser = Parser::new_ext(content, markdown_options());
    let mut html_output = String::new();
    let mut code_block: Option<(Option<String>, String)> = None;

    for event in parser {
        match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                let language = match kind {
                    CodeBlockKind::Fenced(language) if !language.is_empty() => {
                        Some(language.to_string())
                    }
                    _ => None,
                };
                code_block = Some((language, String::new()));
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((language, code)) = code_block.take() {
                    match language {
                        Some(language) => html_output.push_str(&format!(
                            "<pre><code class=\"language-{}\">{}</code></pre>\n",
                            escape_html(&language),
                            escape_html(&code)
                        )),
                        None => html_output
                            .push_str(&format!("<pre><code>{}</code></pre>\n", escape_html(&code))),
                    }
                }
            }
            Event::Text(text) if code_block.is_some() => {
                if let Some((_, code)) = code_block.as_mut() {
                    code.push_str(&text);
                }
            }
            other => {
                pulldown_cmark::html::push_html(&mut html_output, std::iter::once(other));
            }
        }
    }

    html_output
}

pub fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn extract_excerpt(content: &str, max_chars: usize) -> Option<String> {
    let first_paragraph = content
        .split("\n\n")
        .map(str::trim)
        .find(|paragraph| !paragraph.is_empty())?;

    let text: String = first_paragraph
        .chars()
        .filter(|character| !['#', '*', '_', '`', '[', ']', '(', ')'].contains(character))
        .collect();
    let text = text.trim();

    if text.chars().count() <= max_chars {
        Some(text.to_string())
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        let cut = truncated.rfind(' ').unwrap_or(truncated.len());
        Some(format!("{}...", &truncated[..cut]))
    }
}

pub fn word_count(content: &str) -> usize {
    content.split_whitespace().count()
}

pub fn extract_frontmatter(content: &str, path: &Path) -> Result<(Frontmatter, String)> {
    let content = content.replace("\r\n", "\n");
    let content = content.trim_start();

    if let Some(rest) = content.strip_prefix("+++") {
        let (frontmatter, body) = split_frontmatter(rest, "+++", path)?;
        let raw: BTreeMap<String, Value> =
            toml::from_str(frontmatter).map_err(|error| RhizomeError::TomlParse {
                path: path.to_path_buf(),
                message: error.to_string(),
            })?;
        Ok((Frontmatter { raw }, body))
    } else if let Some(rest) = content.strip_prefix("---") {
        let (frontmatter, body) = split_frontmatter(rest, "---", path)?;
        let raw: BTreeMap<String, Value> = if frontmatter.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_yml::from_str(frontmatter).map_err(|error| RhizomeError::YamlParse {
                path: path.to_path_buf(),
                message: error.to_string(),
            })?
        };
        Ok((Frontmatter { raw }, body))
    } else {
        Ok((Frontmatter::default(), content.to_string()))
    }
}

fn split_frontmatter<'a>(
    rest: &'a str,
    delimiter: &str,
    path: &Path,
) -> Result<(&'a str, String)> {
    let end_index =
        find_closing_delimiter(rest, delimiter).ok_or_else(|| RhizomeError::InvalidFrontmatter {
            path: path.to_path_buf(),
        })?;
    let frontmatter = &rest[..end_index];
    let body = rest
        .get(end_index + delimiter.len()..)
        .unwrap_or_default()
        .trim()
        .to_string();
    Ok((frontmatter, body))
}

fn find_closing_delimiter(content: &str, delimiter: &str) -> Option<usize> {
    let mut position = 0;

    for line in content.split('\n') {
        if position > 0 && line.trim() == delimiter {
            return Some(position);
        }
        position += line.len() + 1;
    }

    None
}

pub fn parse_date_from_filename(filename: &str) -> Option<(String, String)> {
    let name = filename.strip_suffix(".md").unwrap_or(filename);
    let date_part = name.get(..10)?;

    let parts: Vec<&str> = date_part.split('-').collect();
    if parts.len() != 3 || parts[0].len() != 4 || parts[1].len() != 2 || parts[2].len() != 2 {
        return None;
    }
    if parts
        .iter()
        .any(|part| !part.chars().all(|character| character.is_ascii_digit()))
    {
        return None;
    }

    let slug = match name.get(10..11) {
        Some("-") if name.len() > 11 => name[11..].to_string(),
        _ => name.to_string(),
    };

    Some((date_part.to_string(), slug))
}

/// Template names referenced by `{% include %}`, `{% extends %}` and `{% import %}`.
pub fn template_dependencies(source: &str) -> BTreeSet<String> {
    let mut dependencies = BTreeSet::new();
    let mut rest = source;

    while let Some(start) = rest.find("{%") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("%}") else {
            break;
        };
        let tag = after[..end].trim().trim_start_matches('-').trim_start();
        let mut words = tag.split_whitespace();
        if let Some(keyword) = words.next()
            && matches!(keyword, "include" | "extends" | "import")
            && let Some(name) = quoted_name(&tag[keyword.len()..])
        {
            dependencies.insert(name);
        }
        rest = &after[end + 2..];
    }

    dependencies
}

fn quoted_name(input: &str) -> Option<String> {
    let input = input.trim_start();
    let quote = input.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = &input[1..];
    let close = inner.find(quote)?;
    Some(inner[..close].to_string())
}
