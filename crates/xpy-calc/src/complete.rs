//! Name completion at a cursor position.

use std::collections::{BTreeMap, HashMap};

use xpy::{CompletionMatch, Completions};

use crate::builtins::Builtin;
use crate::modules::{MODULES, MemberKind, ModuleDef};
use crate::syntax::KEYWORDS;
use crate::value::{Function, Val};

/// Completions for the identifier ending at (`line`, `column`).
///
/// `importable` decides which modules an `import` statement may name.
pub fn complete(
    code: &str,
    line: u32,
    column: u32,
    globals: &HashMap<String, Val>,
    importable: impl Fn(&ModuleDef) -> bool,
) -> Completions {
    let current = code
        .split('\n')
        .nth(line.saturating_sub(1) as usize)
        .unwrap_or_default();
    let before: String = current.chars().take(column as usize).collect();

    let prefix_start = before
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .last()
        .map(|(i, _)| i)
        .unwrap_or(before.len());
    let (head, prefix) = before.split_at(prefix_start);

    let mut found = BTreeMap::new();
    if let Some(owner) = head.strip_suffix('.') {
        let owner = trailing_identifier(owner);
        if let Some(Val::Module(module)) = globals.get(owner) {
            for member in module.members {
                let kind = match member.kind {
                    MemberKind::Function => "function",
                    MemberKind::Constant => "instance",
                };
                found.insert(
                    member.name.to_string(),
                    entry(member.name, kind, member.signature, format!("{}.{}", module.name, member.name)),
                );
            }
        }
    } else if after_import(head) {
        for module in MODULES.iter().filter(|m| importable(m)) {
            found.insert(
                module.name.to_string(),
                entry(module.name, "module", module.doc, module.name.to_string()),
            );
        }
    } else {
        for keyword in KEYWORDS {
            found.insert(keyword.to_string(), entry(keyword, "keyword", "keyword", keyword.to_string()));
        }
        for builtin in Builtin::ALL {
            found.insert(
                builtin.name().to_string(),
                entry(
                    builtin.name(),
                    "function",
                    builtin.signature(),
                    format!("builtins.{}", builtin.name()),
                ),
            );
        }
        for (name, value) in globals {
            let (kind, description) = match value {
                Val::Func(Function::Remote(_)) => ("function", format!("{name}(*args)")),
                Val::Func(function) => ("function", function.name()),
                Val::Module(module) => ("module", module.doc.to_string()),
                other => ("instance", other.type_name().to_string()),
            };
            found.insert(name.clone(), entry(name, kind, &description, format!("__main__.{name}")));
        }
    }

    Completions {
        matches: found
            .into_iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, m)| m)
            .collect(),
    }
}

fn entry(name: &str, kind: &str, description: &str, full_name: String) -> CompletionMatch {
    CompletionMatch {
        name: name.to_string(),
        kind: kind.to_string(),
        description: description.to_string(),
        full_name,
    }
}

fn trailing_identifier(text: &str) -> &str {
    let start = text
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .last()
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[start..]
}

fn after_import(head: &str) -> bool {
    let trimmed = head.trim_end();
    trimmed.len() < head.len() && trailing_identifier(trimmed) == "import"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules;

    fn names(completions: &Completions) -> Vec<&str> {
        completions.matches.iter().map(|m| m.name.as_str()).collect()
    }

    fn globals() -> HashMap<String, Val> {
        let mut globals = HashMap::new();
        globals.insert("math".to_string(), Val::Module(modules::find("math").unwrap()));
        globals.insert("total".to_string(), Val::Int(3));
        globals.insert("spin_count".to_string(), Val::Int(0));
        globals
    }

    #[test]
    fn completes_globals_builtins_and_keywords() {
        let completions = complete("x = sp", 1, 6, &globals(), |_| true);
        assert_eq!(names(&completions), vec!["spin", "spin_count"]);
        assert_eq!(completions.matches[0].full_name, "builtins.spin");
        assert_eq!(completions.matches[1].full_name, "__main__.spin_count");
        assert_eq!(completions.matches[1].kind, "instance");

        let completions = complete("no", 1, 2, &globals(), |_| true);
        assert_eq!(names(&completions), vec!["none"]);
        assert_eq!(completions.matches[0].kind, "keyword");
    }

    #[test]
    fn completes_module_members() {
        let completions = complete("math.s", 1, 6, &globals(), |_| true);
        assert_eq!(names(&completions), vec!["sqrt"]);
        assert_eq!(completions.matches[0].full_name, "math.sqrt");

        let completions = complete("y = math.", 1, 9, &globals(), |_| true);
        assert_eq!(names(&completions), vec!["abs", "floor", "pi", "sqrt"]);
        assert_eq!(completions.matches[2].kind, "instance");

        let completions = complete("total.", 1, 6, &globals(), |_| true);
        assert!(completions.matches.is_empty());
    }

    #[test]
    fn completes_importable_modules_after_import() {
        let completions = complete("import s", 1, 8, &HashMap::new(), |m| m.builtin || m.name == "stats");
        assert_eq!(names(&completions), vec!["stats"]);
        assert_eq!(completions.matches[0].kind, "module");

        let completions = complete("import ", 1, 7, &HashMap::new(), |m| m.builtin);
        assert_eq!(names(&completions), vec!["math"]);
    }

    #[test]
    fn cursor_selects_line_and_column() {
        let code = "pri\nlen";
        let completions = complete(code, 1, 3, &HashMap::new(), |_| true);
        assert_eq!(names(&completions), vec!["print"]);

        let completions = complete(code, 2, 1, &HashMap::new(), |_| true);
        assert_eq!(names(&completions), vec!["len"]);
    }
}
