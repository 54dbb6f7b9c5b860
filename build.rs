use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources. Anything else under the
// package root (build output, vendored reference material) is not scanned.
const SOURCE_ROOTS: [&str; 4] = ["pointing", "src", "tests", "benches"];

// Which source rule a collector enforces. Each rule carries its own explanation.
#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenComment,
    AllowDeadCode,
}

impl Rule {
    fn summary(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => "underscore-prefixed identifiers",
            Rule::ForbiddenComment => "forbidden comment patterns",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed in this project.\n   Either use the binding (removing the underscore) or remove it completely.\n"
            }
            Rule::ForbiddenComment => {
                "Comments narrating edits ('FIXED', 'FIX', 'NEW', 'CHANGED', 'MODIFIED', 'UPDATED', ...) are not allowed.\n   The '**' pattern is not allowed in regular comments (but is allowed in doc comments).\n"
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] attributes are not allowed in this project.\n   Either use the code (removing the attribute) or remove it completely.\n"
            }
        }
    }
}

// A grep sink collecting every offending line of a single file.
struct ViolationCollector {
    rule: Rule,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.summary(),
            self.file_path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str("\n⚠️ ");
        msg.push_str(self.rule.advice());
        Some(msg)
    }

    // Underscore names inside comments and string literals are not code.
    fn is_false_underscore_match(line: &str) -> bool {
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") || line.contains("/*") {
            return true;
        }
        line.split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'))
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        let skip = match self.rule {
            Rule::UnderscorePrefix => Self::is_false_underscore_match(line_text),
            Rule::ForbiddenComment => {
                line_text.trim_start().starts_with("///")
                    && line_text.contains("**")
                    && !FORBIDDEN_WORDS.iter().any(|w| line_text.contains(w))
            }
            Rule::AllowDeadCode => false,
        };
        if !skip {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn scan(rule: Rule, pattern: &str) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();

    for path in rust_sources() {
        let mut collector = ViolationCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(msg) = collector.error_message() {
            return Err(msg.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let forbidden_words = format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|"));
    let checks = [
        (Rule::UnderscorePrefix, r"\b(_[a-zA-Z0-9_]+)\b".to_string()),
        (Rule::ForbiddenComment, forbidden_words),
        (Rule::ForbiddenComment, r"(//|/\*).*\*\*".to_string()),
        (
            Rule::AllowDeadCode,
            r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        ),
    ];

    for (rule, pattern) in &checks {
        if let Err(e) = scan(*rule, pattern) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
