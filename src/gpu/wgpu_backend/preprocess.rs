use std::collections::HashSet;

/// Minimal conditional-compilation pass over shader source.
///
/// Understands `#define NAME`, `#ifdef NAME`, `#ifndef NAME`, `#else` and
/// `#endif`, which is all the material permutations need. Directive lines are
/// dropped; lines in inactive branches are dropped.
pub fn preprocess(source: &str, defines: &[String]) -> String {
    let mut symbols: HashSet<&str> = defines.iter().map(String::as_str).collect();
    // (branch taken, parent active)
    let mut stack: Vec<(bool, bool)> = Vec::new();
    let mut out = String::with_capacity(source.len());

    for line in source.lines() {
        let trimmed = line.trim_start();
        let active = stack.last().map_or(true, |&(taken, parent)| taken && parent);

        if let Some(rest) = trimmed.strip_prefix('#') {
            let mut parts = rest.split_whitespace();
            let directive = parts.next().unwrap_or("");
            let arg = parts.next().unwrap_or("");
            match directive {
                "ifdef" => stack.push((symbols.contains(arg), active)),
                "ifndef" => stack.push((!symbols.contains(arg), active)),
                "else" => {
                    if let Some(top) = stack.last_mut() {
                        top.0 = !top.0;
                    } else {
                        log::warn!("unmatched #else in shader source");
                    }
                }
                "endif" => {
                    if stack.pop().is_none() {
                        log::warn!("unmatched #endif in shader source");
                    }
                }
                "define" if active => {
                    if !arg.is_empty() {
                        symbols.insert(arg);
                    }
                }
                "define" => {}
                other => log::warn!("unknown shader directive #{other}"),
            }
            continue;
        }

        if active {
            out.push_str(line);
            out.push('\n');
        }
    }

    if !stack.is_empty() {
        log::warn!("{} unterminated #if block(s) in shader source", stack.len());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "a\n#ifdef X\nx\n#ifndef Y\nnot_y\n#else\ny\n#endif\n#endif\nb\n";

    #[test]
    fn strips_inactive_branches() {
        let out = preprocess(SRC, &[]);
        assert_eq!(out, "a\nb\n");
    }

    #[test]
    fn nested_branches_follow_defines() {
        let out = preprocess(SRC, &["X".to_owned()]);
        assert_eq!(out, "a\nx\nnot_y\nb\n");
        let out = preprocess(SRC, &["X".to_owned(), "Y".to_owned()]);
        assert_eq!(out, "a\nx\ny\nb\n");
    }

    #[test]
    fn inline_define_enables_later_blocks() {
        let src = "#define Z\n#ifdef Z\nz\n#endif\n";
        assert_eq!(preprocess(src, &[]), "z\n");
    }
}
