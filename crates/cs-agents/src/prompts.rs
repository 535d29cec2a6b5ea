//! Prompt text for the language specialists and the auxiliary personas
//! (debugger, tester, user simulator).
//!
//! Workers differ only in the system prompt returned by
//! [`system_prompt`]; every other prompt is rendered from the task data.

use cs_core::language::LanguageTemplate;

// ---------------------------------------------------------------------------
// Personas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    Debugger,
    Tester,
    UserSimulator,
}

impl Persona {
    pub fn system_prompt(&self) -> &'static str {
        match self {
            Persona::Debugger => DEBUGGER,
            Persona::Tester => TESTER,
            Persona::UserSimulator => USER_SIMULATOR,
        }
    }
}

const DEBUGGER: &str = "You are a debugging specialist. Analyse errors, find the root cause and return corrected code.

RULES:
1. Always return the COMPLETE corrected program, never a fragment
2. Keep all original functionality
3. Fix every error you find
4. The corrected code must run as-is
5. Answer in JSON when asked to";

const TESTER: &str = "You are a QA engineer who writes unit tests.

RULES:
1. Return ONLY test code, no explanations
2. Do not wrap the code in markdown fences
3. Cover success cases, error cases and edge cases
4. Use clear, descriptive assertions
5. Every test must be independent
6. The test code must run as-is";

const USER_SIMULATOR: &str = "You are the end user who asked for this program. Be brief. Answer with the one or two sentences you would give the developer so they can continue. If you do not know, answer 'nao sei'.";

// ---------------------------------------------------------------------------
// Language specialists
// ---------------------------------------------------------------------------

const PYTHON: &str = "You are an expert Python programmer. Answer with working Python code only, no explanations.

MANDATORY RULES:
1. Return ONLY valid Python code
2. Do not use markdown fences
3. Include docstrings and type hints
4. Implement EVERY requested feature
5. Handle errors properly
6. The code must run immediately
7. Follow PEP 8";

const JAVASCRIPT: &str = "You are a JavaScript/Node.js expert: ES2020+, async/await, Express and Jest. Write modern, lint-clean code.";

const TYPESCRIPT: &str = "You are a TypeScript expert: advanced types, generics, strict mode and Node.js. Always type everything explicitly.";

const GO: &str = "You are a Go expert: goroutines and channels, interfaces, net/http and go test. Follow Go idioms and keep everything in package main unless told otherwise.";

const RUST: &str = "You are a Rust expert: ownership and borrowing, traits and generics, error handling with Result. Write safe, idiomatic code that builds with cargo and no extra dependencies unless requested.";

const JAVA: &str = "You are a Java expert: modern Java, Maven and JUnit. Put the entry point in a public class Main and follow clean-code practices.";

const CSHARP: &str = "You are a C# and .NET expert: async/await, LINQ and xUnit. Follow Microsoft conventions.";

const PHP: &str = "You are a modern PHP expert: PHP 8 features, Composer, PSR standards and PHPUnit. Write typed code.";

/// System prompt of the specialist for `language` (canonical name).
pub fn system_prompt(language: &str) -> &'static str {
    match language {
        "python" => PYTHON,
        "javascript" => JAVASCRIPT,
        "typescript" => TYPESCRIPT,
        "go" => GO,
        "rust" => RUST,
        "java" => JAVA,
        "csharp" => CSHARP,
        "php" => PHP,
        _ => PYTHON,
    }
}

// ---------------------------------------------------------------------------
// Task prompts
// ---------------------------------------------------------------------------

pub fn analyze_requirements(tpl: &LanguageTemplate, description: &str) -> String {
    let ext = tpl.extension;
    format!(
        r#"Analyse the requirements of the following project and return structured JSON.

PROJECT: {description}

Return ONLY valid JSON with:
{{
    "project_name": "project_name",
    "description": "short description",
    "features": ["feature1", "feature2"],
    "dependencies": ["dep1", "dep2"],
    "files_needed": ["main{ext}"],
    "estimated_complexity": "low|medium|high"
}}"#
    )
}

pub fn generate_code(language: &str, description: &str, context: &str, examples: &str) -> String {
    let mut prompt = format!("Implement the following in {language}:\n\nREQUIREMENTS:\n{description}\n");
    if !context.is_empty() {
        prompt.push_str(&format!("\nADDITIONAL CONTEXT: {context}\n"));
    }
    if !examples.is_empty() {
        prompt.push_str(&format!("\nREFERENCE EXAMPLES:\n{examples}\n"));
    }
    prompt.push_str(&format!(
        "\nINSTRUCTIONS:
1. Implement ALL features listed in the requirements
2. Use well-structured functions and types
3. Document each function
4. Handle errors properly
5. The code must be complete and runnable
6. Include an entry point

Return ONLY the complete {language} code, no explanations."
    ));
    prompt
}

/// Second attempt after an empty or too-short generation: spells out every
/// feature.
pub fn generate_explicit(language: &str, project_name: &str, features: &[String]) -> String {
    let list: Vec<String> = features.iter().map(|f| format!("- {f}")).collect();
    format!(
        "Implement a {project_name} in {language}.

REQUIRED FEATURES:
{}

The code must:
1. Implement ALL of the features above
2. Be complete and runnable
3. Include a main function or entry point
4. Follow {language} best practices",
        list.join("\n")
    )
}

pub fn generate_tests(tpl: &LanguageTemplate, code: &str, description: &str) -> String {
    let framework = tpl.test_cmd.split_whitespace().next().unwrap_or("the standard framework");
    let mut prompt = format!(
        "Write unit tests in {} for the code below.\n\nCODE UNDER TEST:\n{code}\n",
        tpl.name
    );
    if !description.is_empty() {
        prompt.push_str(&format!("\nPROJECT DESCRIPTION: {description}\n"));
    }
    prompt.push_str(&format!(
        "\nINSTRUCTIONS:
1. Use {framework} as the test framework
2. The code under test lives in {main}; import it from there
3. Test EVERY public function
4. Include success cases, error cases and edge cases
5. Every test must be independent

Return ONLY the test code, no explanations.",
        main = tpl.main_file()
    ));
    prompt
}

pub fn analyze_error(language: &str, code: &str, error: &str) -> String {
    format!(
        r#"Analyse and fix the error in this {language} code.

CODE WITH ERROR:
{code}

ERROR MESSAGE:
{error}

TASK:
1. Identify the root cause
2. Fix the code completely
3. Keep all original functionality

Return ONLY valid JSON in the form:
{{"cause": "short description of the cause", "fix_suggestion": "what was fixed", "corrected_code": "complete corrected code"}}

IMPORTANT: corrected_code must hold the COMPLETE working {language} program."#
    )
}

pub fn simulate_user(description: &str, errors: &[String]) -> String {
    let recent: Vec<&str> = errors.iter().take(3).map(String::as_str).collect();
    format!(
        "The developer tried to build: {description}\nRecent errors: {}\nIf needed, reply with the information you would give so they can continue (one or two sentences). If you do not know, reply 'nao sei'.",
        recent.join(" | ")
    )
}

/// Message sent to the human when every automated path failed.
pub fn escalation_message(description: &str, errors: &[String]) -> String {
    let mut msg = format!(
        "The agent could not complete your task.\n\nTask: {description}\n"
    );
    if let Some(last) = errors.last() {
        let short: String = last.chars().take(400).collect();
        msg.push_str(&format!("\nLast error: {short}\n"));
    }
    msg.push_str("\nPlease reply with the missing information or a confirmation.\nYour reply will be used to train the assistant.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_core::language;

    #[test]
    fn every_language_has_a_prompt() {
        for lang in language::supported() {
            assert!(!system_prompt(lang).is_empty());
        }
        assert!(system_prompt("go").contains("Go"));
    }

    #[test]
    fn generate_prompt_includes_optional_sections() {
        let p = generate_code("python", "sum two ints", "", "");
        assert!(!p.contains("ADDITIONAL CONTEXT"));
        assert!(!p.contains("REFERENCE EXAMPLES"));
        let p = generate_code("python", "sum two ints", "use argparse", "def add(a, b): ...");
        assert!(p.contains("ADDITIONAL CONTEXT: use argparse"));
        assert!(p.contains("REFERENCE EXAMPLES:\ndef add"));
    }

    #[test]
    fn test_prompt_names_framework_and_main_file() {
        let tpl = language::template("python").unwrap();
        let p = generate_tests(tpl, "def f(): pass", "");
        assert!(p.contains("Use pytest"));
        assert!(p.contains("main.py"));
    }

    #[test]
    fn explicit_prompt_lists_features() {
        let p = generate_explicit("go", "calculator", &["add".into(), "sub".into()]);
        assert!(p.contains("- add\n- sub"));
    }
}
