//! Extglob Module
//!
//! Compiles hosting-rule source patterns (extended globs with `**`
//! globstars, `*`/`?`/`+`/`@` sub-expression groups, character classes and
//! `/:param` named captures) into anchored [`regex::Regex`] values, and
//! rule destinations with `:param` references into regex replacement
//! templates.

use crate::{ProxyError, Result};
use regex::Regex;

/// Compile an extended glob into an anchored regular expression.
pub fn compile_ext_glob(extglob: &str) -> Result<Regex> {
    let mut compiler = GlobCompiler {
        glob: extglob.as_bytes(),
        out: Vec::new(),
        pos: 0,
        depth: 0,
    };
    compiler.compile_globstar_prefix();
    compiler
        .compile_expression()
        .map_err(|e| ProxyError::RulesError(format!("glob {:?}: {}", extglob, e)))?;

    let pattern = String::from_utf8(compiler.out)
        .map_err(|e| ProxyError::RulesError(format!("glob {:?}: {}", extglob, e)))?;
    Regex::new(&format!("^{}$", pattern))
        .map_err(|e| ProxyError::RulesError(format!("glob {:?}: {}", extglob, e)))
}

/// Compile a rule destination into a regex replacement template:
/// `:param` segments become `${param}` references and literal `$` is
/// escaped as `$$`.
pub fn compile_template(template: &str) -> String {
    let bytes = template.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut pos = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            b':' if pos == 0 || bytes[pos - 1] == b'/' => {
                out.extend_from_slice(b"${");
                pos += 1;
                while pos < bytes.len() {
                    match bytes[pos] {
                        b'/' => break,
                        b'?' | b'+' | b'*' => {
                            pos += 1;
                            break;
                        }
                        c => {
                            out.push(c);
                            pos += 1;
                        }
                    }
                }
                out.push(b'}');
            }
            b'$' => {
                out.extend_from_slice(b"$$");
                pos += 1;
            }
            c => {
                out.push(c);
                pos += 1;
            }
        }
    }

    String::from_utf8(out).unwrap_or_else(|_| template.to_string())
}

struct GlobCompiler<'a> {
    glob: &'a [u8],
    out: Vec<u8>,
    pos: usize,
    depth: usize,
}

impl GlobCompiler<'_> {
    fn compile_expression(&mut self) -> std::result::Result<(), String> {
        while self.pos < self.glob.len() {
            match self.glob[self.pos] {
                b'\\' => self.compile_escape_sequence()?,
                b'*' => self.compile_sub_expression(b"(?:", b")*", b"[^/]*")?,
                b'?' => self.compile_sub_expression(b"(?:", b")?", b"[^/]")?,
                b'+' => self.compile_sub_expression(b"(?:", b")+", b"\\+")?,
                b'@' => self.compile_sub_expression(b"(?:", b")", b"\\@")?,
                b'!' => {
                    // The regex engine has no complement operator
                    if self.glob.get(self.pos + 1) == Some(&b'(') {
                        return Err("negated group !(...) is not supported".to_string());
                    }
                    self.out.extend_from_slice(b"\\!");
                    self.pos += 1;
                }
                b')' => {
                    if self.depth > 0 {
                        return Ok(());
                    }
                    self.out.extend_from_slice(b"\\)");
                    self.pos += 1;
                }
                b'|' => {
                    if self.depth > 0 {
                        self.out.push(b'|');
                    } else {
                        self.out.extend_from_slice(b"\\|");
                    }
                    self.pos += 1;
                }
                b'/' => {
                    if self.depth == 0 {
                        let rest = &self.glob[self.pos..];
                        if rest.starts_with(b"/**") && (rest.len() == 3 || rest[3] == b'/') {
                            self.out.extend_from_slice(b"(?:/.*)?");
                            self.pos += 3;
                            continue;
                        }
                        if rest.starts_with(b"/:") {
                            self.compile_named_capture();
                            continue;
                        }
                    }
                    self.out.push(b'/');
                    self.pos += 1;
                }
                b'[' => self.compile_character_class()?,
                c @ (b'.' | b'^' | b'$' | b'(' | b'{') => {
                    self.out.push(b'\\');
                    self.out.push(c);
                    self.pos += 1;
                }
                c => {
                    self.out.push(c);
                    self.pos += 1;
                }
            }
        }

        if self.depth > 0 {
            return Err("missing closing )".to_string());
        }
        Ok(())
    }

    fn compile_sub_expression(
        &mut self,
        prefix: &[u8],
        suffix: &[u8],
        noexpr: &[u8],
    ) -> std::result::Result<(), String> {
        if self.glob.get(self.pos + 1) == Some(&b'(') {
            self.out.extend_from_slice(prefix);
            self.depth += 1;
            self.pos += 2;
            self.compile_expression()?;
            self.out.extend_from_slice(suffix);
            self.depth -= 1;
            self.pos += 1;
        } else {
            self.out.extend_from_slice(noexpr);
            self.pos += 1;
        }
        Ok(())
    }

    fn compile_character_class(&mut self) -> std::result::Result<(), String> {
        self.out.push(b'[');
        self.pos += 1;

        if self.pos < self.glob.len() {
            match self.glob[self.pos] {
                c @ (b']' | b'-') => {
                    self.out.push(c);
                    self.pos += 1;
                }
                b'!' | b'^' => {
                    self.out.push(b'^');
                    self.pos += 1;

                    if self.glob.get(self.pos) == Some(&b']') {
                        self.out.push(b']');
                        self.pos += 1;
                    }
                }
                _ => {}
            }
        }

        while self.pos < self.glob.len() {
            let rest = &self.glob[self.pos..];
            if rest.starts_with(b"[:") {
                if let Some(i) = find_subslice(&rest[2..], b":]") {
                    self.out.extend_from_slice(&rest[..4 + i]);
                    self.pos += 4 + i;
                    continue;
                }
            }

            match self.glob[self.pos] {
                b'\\' => self.compile_escape_sequence()?,
                b']' => {
                    self.out.push(b']');
                    self.pos += 1;
                    return Ok(());
                }
                c => {
                    self.out.push(c);
                    self.pos += 1;
                }
            }
        }

        Err("missing closing ]".to_string())
    }

    fn compile_escape_sequence(&mut self) -> std::result::Result<(), String> {
        if self.pos + 1 == self.glob.len() {
            return Err("trailing backslash".to_string());
        }
        self.out.push(b'\\');
        self.out.push(self.glob[self.pos + 1]);
        self.pos += 2;
        Ok(())
    }

    fn compile_globstar_prefix(&mut self) {
        while self.glob[self.pos..].starts_with(b"**/") {
            self.out.extend_from_slice(b"(?:[^/].*/)?");
            self.pos += 3;
        }
        let rest = &self.glob[self.pos..];
        if rest.len() == 2 && rest.starts_with(b"**") {
            self.out.extend_from_slice(b"(?:[^/].*)?");
            self.pos += 2;
        }
    }

    fn compile_named_capture(&mut self) {
        self.out.extend_from_slice(b"(?:/(?P<");
        self.pos += 2;

        while self.pos < self.glob.len() {
            match self.glob[self.pos] {
                b'/' => {
                    self.out.extend_from_slice(b">[^/]+))");
                    return;
                }
                b'?' => {
                    self.out.extend_from_slice(b">[^/]*))?");
                    self.pos += 1;
                    return;
                }
                b'+' => {
                    self.out.extend_from_slice(b">.+))");
                    self.pos += 1;
                    return;
                }
                b'*' => {
                    self.out.extend_from_slice(b">.*))?");
                    self.pos += 1;
                    return;
                }
                c => {
                    self.out.push(c);
                    self.pos += 1;
                }
            }
        }

        self.out.extend_from_slice(b">[^/]+))");
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
