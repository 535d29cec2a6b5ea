//! Table of supported target languages and their container templates.
//!
//! Workers differ only in their system prompt and the template returned
//! here, so adding a language means adding one row.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct LanguageTemplate {
    pub name: &'static str,
    pub base_image: &'static str,
    pub install_cmd: &'static str,
    pub run_cmd: &'static str,
    pub test_cmd: &'static str,
    /// Includes the leading dot.
    pub extension: &'static str,
    /// Host ports claimed for this language, inclusive start, exclusive end.
    pub port_range: (u16, u16),
    pub default_packages: &'static [&'static str],
    pub dockerfile_extra: &'static str,
    pub capabilities: &'static [&'static str],
}

impl LanguageTemplate {
    /// File name of the main entry point inside the project directory.
    pub fn main_file(&self) -> String {
        format!("main{}", self.extension)
    }

    /// File name the test runner expects for generated tests.
    pub fn test_file(&self) -> String {
        match self.name {
            "python" => "test_main.py".to_string(),
            "javascript" => "main.test.js".to_string(),
            "typescript" => "main.test.ts".to_string(),
            "go" => "main_test.go".to_string(),
            _ => format!("test_main{}", self.extension),
        }
    }

    /// Command that executes `file` inside the container.
    pub fn run_command(&self, file: &str) -> String {
        match self.name {
            "go" => format!("{} {}", self.run_cmd, file),
            "rust" | "csharp" => self.run_cmd.to_string(),
            "java" => format!("javac {file} && {} {}", self.run_cmd, file.trim_end_matches(".java")),
            _ => format!("{} {}", self.run_cmd, file),
        }
    }

    /// Command that runs the test suite; `test_file` is passed where the
    /// runner accepts a single file.
    pub fn test_command(&self, test_file: &str) -> String {
        match self.name {
            "python" => format!("{} -q {}", self.test_cmd, test_file),
            "javascript" | "typescript" => format!("npx jest {test_file}"),
            _ => self.test_cmd.to_string(),
        }
    }
}

const APT_GIT: &str = "RUN apt-get update && apt-get install -y --no-install-recommends git && rm -rf /var/lib/apt/lists/*\n";

pub static TEMPLATES: &[LanguageTemplate] = &[
    LanguageTemplate {
        name: "python",
        base_image: "python:3.12-slim",
        install_cmd: "pip install --no-cache-dir",
        run_cmd: "python",
        test_cmd: "pytest",
        extension: ".py",
        port_range: (8000, 8100),
        default_packages: &["pytest", "black", "mypy", "ruff"],
        dockerfile_extra: "RUN apt-get update && apt-get install -y --no-install-recommends git curl && rm -rf /var/lib/apt/lists/*\n",
        capabilities: &["scripts", "web apis", "data processing", "automation", "testing"],
    },
    LanguageTemplate {
        name: "javascript",
        base_image: "node:20-slim",
        install_cmd: "npm install",
        run_cmd: "node",
        test_cmd: "npm test",
        extension: ".js",
        port_range: (3000, 3100),
        default_packages: &["jest", "eslint", "prettier"],
        dockerfile_extra: APT_GIT,
        capabilities: &["node services", "web apis", "cli tools", "testing"],
    },
    LanguageTemplate {
        name: "typescript",
        base_image: "node:20-slim",
        install_cmd: "npm install",
        run_cmd: "npx ts-node",
        test_cmd: "npm test",
        extension: ".ts",
        port_range: (3100, 3200),
        default_packages: &["typescript", "ts-node", "jest", "@types/node", "eslint"],
        dockerfile_extra: "RUN apt-get update && apt-get install -y --no-install-recommends git && rm -rf /var/lib/apt/lists/*\nRUN npm install -g typescript ts-node\n",
        capabilities: &["typed node services", "web apis", "testing"],
    },
    LanguageTemplate {
        name: "go",
        base_image: "golang:1.22-alpine",
        install_cmd: "go get",
        run_cmd: "go run",
        test_cmd: "go test -v ./...",
        extension: ".go",
        port_range: (4000, 4100),
        default_packages: &[],
        dockerfile_extra: "RUN apk add --no-cache git gcc musl-dev\n",
        capabilities: &["network services", "cli tools", "concurrency"],
    },
    LanguageTemplate {
        name: "rust",
        base_image: "rust:1.75-slim",
        install_cmd: "cargo add",
        run_cmd: "cargo run",
        test_cmd: "cargo test",
        extension: ".rs",
        port_range: (4100, 4200),
        default_packages: &[],
        dockerfile_extra: "RUN apt-get update && apt-get install -y --no-install-recommends git pkg-config libssl-dev && rm -rf /var/lib/apt/lists/*\n",
        capabilities: &["systems programming", "cli tools", "performance"],
    },
    LanguageTemplate {
        name: "java",
        base_image: "eclipse-temurin:21-jdk-alpine",
        install_cmd: "mvn dependency:resolve",
        run_cmd: "java",
        test_cmd: "mvn test",
        extension: ".java",
        port_range: (8080, 8180),
        default_packages: &["junit", "mockito"],
        dockerfile_extra: "RUN apk add --no-cache maven git\n",
        capabilities: &["enterprise services", "web apis", "testing"],
    },
    LanguageTemplate {
        name: "csharp",
        base_image: "mcr.microsoft.com/dotnet/sdk:8.0",
        install_cmd: "dotnet add package",
        run_cmd: "dotnet run",
        test_cmd: "dotnet test",
        extension: ".cs",
        port_range: (5000, 5100),
        default_packages: &["xunit", "Moq"],
        dockerfile_extra: APT_GIT,
        capabilities: &["dotnet services", "web apis", "testing"],
    },
    LanguageTemplate {
        name: "php",
        base_image: "php:8.3-cli",
        install_cmd: "composer require",
        run_cmd: "php",
        test_cmd: "vendor/bin/phpunit",
        extension: ".php",
        port_range: (9000, 9100),
        default_packages: &["phpunit/phpunit"],
        dockerfile_extra: "RUN apt-get update && apt-get install -y --no-install-recommends git unzip && rm -rf /var/lib/apt/lists/*\nCOPY --from=composer:latest /usr/bin/composer /usr/bin/composer\n",
        capabilities: &["web backends", "scripts"],
    },
];

/// Resolve aliases (`py`, `node`, `golang`, ...) to the canonical name.
pub fn normalize(language: &str) -> Option<&'static str> {
    let lower = language.trim().to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "py" | "python3" => "python",
        "js" | "node" | "nodejs" => "javascript",
        "ts" => "typescript",
        "golang" => "go",
        "rs" => "rust",
        "c#" | "cs" | "dotnet" => "csharp",
        other => other,
    };
    TEMPLATES.iter().find(|t| t.name == canonical).map(|t| t.name)
}

/// Template for `language` (aliases accepted).
pub fn template(language: &str) -> Option<&'static LanguageTemplate> {
    let name = normalize(language)?;
    TEMPLATES.iter().find(|t| t.name == name)
}

/// Canonical names of every supported language, in table order.
pub fn supported() -> Vec<&'static str> {
    TEMPLATES.iter().map(|t| t.name).collect()
}
