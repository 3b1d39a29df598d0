//! Minimal KeyValues (VDF) text format support
//!
//! The key store persists depot decryption keys in the nested
//! `"key" "value"` text form used by `config.vdf` files:
//!
//! ```text
//! "depots"
//! {
//! 	"3"
//! 	{
//! 		"DecryptionKey"		"ab01..."
//! 	}
//! }
//! ```
//!
//! Only the subset needed for that file is implemented: quoted keys,
//! quoted string values, and brace-nested maps with tab indentation.

/// Errors from parsing VDF text.
#[derive(Debug, thiserror::Error)]
pub enum VdfError {
    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Unexpected token at offset {0}")]
    UnexpectedToken(usize),

    #[error("Unterminated string at offset {0}")]
    UnterminatedString(usize),
}

/// One VDF value: a string leaf or a nested map.
///
/// Maps preserve insertion order; callers that need sorted output sort
/// before building the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VdfNode {
    Str(String),
    Map(Vec<(String, VdfNode)>),
}

impl VdfNode {
    /// Look up a key in a map node.
    pub fn get(&self, key: &str) -> Option<&VdfNode> {
        match self {
            VdfNode::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            VdfNode::Str(_) => None,
        }
    }

    /// Borrow the string value of a leaf node.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VdfNode::Str(s) => Some(s),
            VdfNode::Map(_) => None,
        }
    }

    /// Borrow the entries of a map node.
    pub fn entries(&self) -> Option<&[(String, VdfNode)]> {
        match self {
            VdfNode::Map(entries) => Some(entries),
            VdfNode::Str(_) => None,
        }
    }
}

/// Pretty-print a root key and its node as VDF text.
pub fn dump(root_key: &str, node: &VdfNode) -> String {
    let mut out = String::new();
    write_node(&mut out, root_key, node, 0);
    out
}

fn write_node(out: &mut String, key: &str, node: &VdfNode, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
    match node {
        VdfNode::Str(value) => {
            out.push('"');
            out.push_str(key);
            out.push_str("\"\t\t\"");
            out.push_str(value);
            out.push_str("\"\n");
        }
        VdfNode::Map(entries) => {
            out.push('"');
            out.push_str(key);
            out.push_str("\"\n");
            for _ in 0..depth {
                out.push('\t');
            }
            out.push_str("{\n");
            for (k, v) in entries {
                write_node(out, k, v, depth + 1);
            }
            for _ in 0..depth {
                out.push('\t');
            }
            out.push_str("}\n");
        }
    }
}

/// Parse VDF text into its root `(key, node)` pair.
pub fn parse(input: &str) -> Result<(String, VdfNode), VdfError> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let (key, node) = parse_entry(&tokens, &mut pos)?;
    Ok((key, node))
}

#[derive(Debug)]
enum Token {
    Str(String),
    Open(usize),
    Close(usize),
}

fn tokenize(input: &str) -> Result<Vec<Token>, VdfError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'{' => {
                tokens.push(Token::Open(i));
                i += 1;
            }
            b'}' => {
                tokens.push(Token::Close(i));
                i += 1;
            }
            b'"' => {
                let start = i;
                i += 1;
                let begin = i;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(VdfError::UnterminatedString(start));
                }
                tokens.push(Token::Str(input[begin..i].to_string()));
                i += 1;
            }
            _ => return Err(VdfError::UnexpectedToken(i)),
        }
    }
    Ok(tokens)
}

fn parse_entry(tokens: &[Token], pos: &mut usize) -> Result<(String, VdfNode), VdfError> {
    let key = match tokens.get(*pos) {
        Some(Token::Str(s)) => s.clone(),
        Some(Token::Open(off)) | Some(Token::Close(off)) => {
            return Err(VdfError::UnexpectedToken(*off))
        }
        None => return Err(VdfError::UnexpectedEof),
    };
    *pos += 1;

    match tokens.get(*pos) {
        Some(Token::Str(s)) => {
            let value = s.clone();
            *pos += 1;
            Ok((key, VdfNode::Str(value)))
        }
        Some(Token::Open(_)) => {
            *pos += 1;
            let mut entries = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(Token::Close(_)) => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => entries.push(parse_entry(tokens, pos)?),
                    None => return Err(VdfError::UnexpectedEof),
                }
            }
            Ok((key, VdfNode::Map(entries)))
        }
        Some(Token::Close(off)) => Err(VdfError::UnexpectedToken(*off)),
        None => Err(VdfError::UnexpectedEof),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_nested() {
        let node = VdfNode::Map(vec![(
            "3".to_string(),
            VdfNode::Map(vec![(
                "DecryptionKey".to_string(),
                VdfNode::Str("ab01".to_string()),
            )]),
        )]);
        let text = dump("depots", &node);
        assert_eq!(
            text,
            "\"depots\"\n{\n\t\"3\"\n\t{\n\t\t\"DecryptionKey\"\t\t\"ab01\"\n\t}\n}\n"
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let node = VdfNode::Map(vec![
            (
                "3".to_string(),
                VdfNode::Map(vec![(
                    "DecryptionKey".to_string(),
                    VdfNode::Str("aa".to_string()),
                )]),
            ),
            (
                "5".to_string(),
                VdfNode::Map(vec![(
                    "DecryptionKey".to_string(),
                    VdfNode::Str("bb".to_string()),
                )]),
            ),
        ]);
        let text = dump("depots", &node);
        let (key, parsed) = parse(&text).unwrap();
        assert_eq!(key, "depots");
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_parse_empty_map() {
        let (key, node) = parse("\"depots\"\n{\n}\n").unwrap();
        assert_eq!(key, "depots");
        assert_eq!(node, VdfNode::Map(vec![]));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("\"depots\"").is_err());
        assert!(parse("\"depots\" {").is_err());
        assert!(parse("\"unterminated").is_err());
        assert!(parse("depots {}").is_err());
    }

    #[test]
    fn test_get_and_as_str() {
        let (_, node) = parse("\"depots\"\n{\n\t\"7\"\n\t{\n\t\t\"DecryptionKey\"\t\t\"cc\"\n\t}\n}\n").unwrap();
        let key = node
            .get("7")
            .and_then(|d| d.get("DecryptionKey"))
            .and_then(|v| v.as_str());
        assert_eq!(key, Some("cc"));
    }
}
