//! Parsers for E-utilities responses.
//!
//! esummary, elink and esearch are read as JSON; efetch abstracts come back
//! as PubMed XML and are scanned with a small tag extractor.

use std::collections::HashMap;

use medlit_core::MetadataError;
use medlit_core::metadata::ArticleSummary;
use serde_json::Value;

const CITED_IN_LINKNAME: &str = "pubmed_pubmed_citedin";

/// Parse an `esummary.fcgi` JSON body into summaries keyed by PMID.
///
/// Records the service flags with an `error` field are skipped.
pub fn parse_esummary(body: &Value) -> Result<HashMap<String, ArticleSummary>, MetadataError> {
    let result = body
        .get("result")
        .ok_or_else(|| MetadataError::ResponseParse {
            message: match body.get("error").and_then(|e| e.as_str()) {
                Some(error) => format!("esummary error: {error}"),
                None => "esummary response has no result".to_string(),
            },
        })?;
    let uids = result
        .get("uids")
        .and_then(|u| u.as_array())
        .ok_or_else(|| MetadataError::ResponseParse {
            message: "esummary result has no uids".to_string(),
        })?;

    let mut summaries = HashMap::with_capacity(uids.len());
    for uid in uids.iter().filter_map(id_string) {
        let Some(record) = result.get(&uid) else {
            continue;
        };
        if record.get("error").is_some() {
            continue;
        }
        summaries.insert(uid.clone(), summary_from_record(uid, record));
    }
    Ok(summaries)
}

fn summary_from_record(identifier: String, record: &Value) -> ArticleSummary {
    let text = |key: &str| {
        record
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let doi = record
        .get("articleids")
        .and_then(|a| a.as_array())
        .and_then(|ids| {
            ids.iter().find_map(|id| {
                (id.get("idtype")?.as_str()? == "doi")
                    .then(|| id.get("value")?.as_str().map(str::to_string))
                    .flatten()
            })
        });

    let string_list = |key: &str, field: Option<&str>| -> Vec<String> {
        record
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match field {
                        Some(f) => item.get(f)?.as_str(),
                        None => item.as_str(),
                    })
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    ArticleSummary {
        identifier,
        title: text("title").map(|t| normalize_whitespace(&t)),
        journal: text("fulljournalname").or_else(|| text("source")),
        publication_date: text("pubdate"),
        article_types: string_list("pubtype", None),
        doi,
        authors: string_list("authors", Some("name")),
    }
}

/// Parse an `elink.fcgi` JSON body into cited-by counts.
///
/// Every requested identifier is present in the result; identifiers with no
/// `pubmed_pubmed_citedin` links count as zero.
pub fn parse_elink(body: &Value, requested: &[String]) -> Result<HashMap<String, u64>, MetadataError> {
    let mut counts: HashMap<String, u64> = requested.iter().map(|id| (id.clone(), 0)).collect();

    let Some(linksets) = body.get("linksets").and_then(|l| l.as_array()) else {
        if let Some(error) = body.get("ERROR").or_else(|| body.get("error")) {
            return Err(MetadataError::ResponseParse {
                message: format!("elink error: {error}"),
            });
        }
        // No linksets at all: nothing cites anything.
        return Ok(counts);
    };

    for linkset in linksets {
        let Some(id) = linkset
            .get("ids")
            .and_then(|ids| ids.as_array())
            .and_then(|ids| ids.first())
            .and_then(id_string)
        else {
            continue;
        };
        let cited_by = linkset
            .get("linksetdbs")
            .and_then(|dbs| dbs.as_array())
            .and_then(|dbs| {
                dbs.iter().find(|db| {
                    db.get("linkname").and_then(|n| n.as_str()) == Some(CITED_IN_LINKNAME)
                })
            })
            .and_then(|db| db.get("links"))
            .and_then(|links| links.as_array())
            .map(|links| links.len() as u64)
            .unwrap_or(0);
        if let Some(count) = counts.get_mut(&id) {
            *count = cited_by;
        }
    }
    Ok(counts)
}

/// First PMID of an `esearch.fcgi` JSON body.
pub fn parse_esearch(body: &Value) -> Option<String> {
    body.get("esearchresult")?
        .get("idlist")?
        .as_array()?
        .first()
        .and_then(id_string)
}

/// Parse an `efetch.fcgi` PubMed XML body into abstracts keyed by PMID.
///
/// Structured abstracts are joined section by section, each prefixed with
/// its `Label`. Articles without abstract text are omitted.
pub fn parse_efetch_abstracts(xml: &str) -> HashMap<String, String> {
    let mut abstracts = HashMap::new();
    for article in extract_blocks(xml, "PubmedArticle") {
        let Some(pmid) = extract_tag_text(article, "PMID") else {
            continue;
        };
        let Some(abstract_block) = extract_blocks(article, "Abstract").into_iter().next() else {
            continue;
        };

        let sections: Vec<String> = extract_blocks(abstract_block, "AbstractText")
            .into_iter()
            .filter_map(|section| {
                let open_end = section.find('>')?;
                let open_tag = &section[..open_end];
                let inner = inner_text(section, "AbstractText")?;
                let text = normalize_whitespace(&decode_entities(&strip_tags(inner)));
                if text.is_empty() {
                    return None;
                }
                Some(match extract_attribute(open_tag, "Label") {
                    Some(label) if !label.trim().is_empty() => {
                        format!("{}: {}", decode_entities(label.trim()), text)
                    }
                    _ => text,
                })
            })
            .collect();

        if !sections.is_empty() {
            abstracts.insert(pmid.trim().to_string(), sections.join("\n\n"));
        }
    }
    abstracts
}

/// Identifier values arrive as strings or numbers depending on the endpoint.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// All `<tag ...>...</tag>` blocks, including the tags themselves.
///
/// Matches the exact element name, so `<Abstract>` does not match
/// `<AbstractText>`. Self-closing elements are skipped.
fn extract_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut search_from = 0;

    while let Some(pos) = xml[search_from..].find(&open) {
        let start = search_from + pos;
        let after_name = start + open.len();
        let Some(next) = xml[after_name..].chars().next() else {
            break;
        };
        if !(next == '>' || next.is_whitespace()) {
            search_from = after_name;
            continue;
        }
        let Some(open_end) = xml[start..].find('>').map(|p| start + p) else {
            break;
        };
        if xml[..open_end].ends_with('/') {
            search_from = open_end + 1;
            continue;
        }
        let Some(end) = xml[open_end..].find(&close).map(|p| open_end + p + close.len()) else {
            break;
        };
        blocks.push(&xml[start..end]);
        search_from = end;
    }
    blocks
}

/// Text between the opening and closing tag of a block from [`extract_blocks`].
fn inner_text<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let content_start = block.find('>')? + 1;
    let content_end = block.rfind(&format!("</{tag}>"))?;
    (content_start <= content_end).then(|| &block[content_start..content_end])
}

/// Extract the text content of the first `<tag>text</tag>`.
fn extract_tag_text(xml: &str, tag: &str) -> Option<String> {
    let block = extract_blocks(xml, tag).into_iter().next()?;
    inner_text(block, tag).map(|t| t.trim().to_string())
}

/// Extract an attribute value from an opening tag.
fn extract_attribute(tag: &str, attr: &str) -> Option<String> {
    let search = format!(" {attr}=\"");
    let start = tag.find(&search)? + search.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

/// Remove inline markup such as `<i>`, `<sup>` and `<b>`.
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Decode the predefined XML entities and numeric character references.
fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &tail[1..semi];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => {
                    let code = if let Some(hex) =
                        entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X"))
                    {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        entity.strip_prefix('#').and_then(|d| d.parse().ok())
                    };
                    code.and_then(char::from_u32)
                }
            }?;
            Some((c, semi + 1))
        });
        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Collapse runs of whitespace into single spaces.
fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
