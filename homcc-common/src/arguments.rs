//! The compiler-argument surface the core consumes.
//!
//! Full compiler argument parsing is an external concern; the client and
//! server only need to answer a handful of questions about an argv: which
//! compiler, which source files, which output, is it a plain `-c`
//! compilation, and what would a dependency-listing invocation look like.

use crate::error::ArgvError;
use serde::{Deserialize, Serialize};

/// Compiler used when neither the invocation nor the config names one.
pub const DEFAULT_COMPILER: &str = "gcc";

/// Extensions the compiler treats as translation-unit inputs.
const SOURCE_EXTENSIONS: &[&str] = &[
    "c", "cc", "cp", "cxx", "cpp", "c++", "C", "i", "ii", "m", "mm", "s", "S",
];

/// Flags that consume the following argument as their value.
const FLAGS_WITH_VALUE: &[&str] = &[
    "-o", "-I", "-isystem", "-iquote", "-idirafter", "-imacros", "-include", "-x", "-Xassembler",
    "-Xpreprocessor", "-Xlinker", "-MF", "-MT", "-MQ", "-D", "-U", "-L", "-T", "-u", "--param",
    "-aux-info", "-arch", "--sysroot", "-target",
];

/// Path-taking flags the server must re-parent into the job tree.
pub const PATH_FLAGS: &[&str] = &["-I", "-isystem", "-iquote", "-idirafter", "-imacros", "-include"];

/// A compiler invocation: the compiler plus everything after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerArgs {
    compiler: String,
    args: Vec<String>,
}

impl CompilerArgs {
    pub fn new(compiler: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            compiler: compiler.into(),
            args,
        }
    }

    /// Split a raw argv into compiler and arguments. The first element is
    /// the compiler, as in a `CCACHE_PREFIX`-style invocation.
    pub fn from_argv(argv: &[String]) -> Result<Self, ArgvError> {
        let (compiler, rest) = argv.split_first().ok_or(ArgvError::MissingCompiler)?;
        Ok(Self::new(compiler.clone(), rest.to_vec()))
    }

    /// Whether a leading argument names a compiler rather than a flag or a
    /// source file (`homcc gcc -c x.c` vs `homcc -c x.c`).
    pub fn looks_like_compiler(arg: &str) -> bool {
        if arg.starts_with('-') || is_source_file(arg) {
            return false;
        }
        let stem = arg.rsplit('/').next().unwrap_or(arg);
        let stem = stem.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '-');
        matches!(stem, "gcc" | "g++" | "cc" | "c++" | "clang" | "clang++")
            || stem.ends_with("gcc")
            || stem.ends_with("g++")
            || stem.ends_with("clang")
            || stem.ends_with("clang++")
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Full argv including the compiler, as shipped in an `ArgumentRequest`.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + self.args.len());
        argv.push(self.compiler.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Arguments that are translation-unit inputs.
    pub fn source_files(&self) -> Vec<&str> {
        let mut sources = Vec::new();
        let mut iter = self.args.iter();
        while let Some(arg) = iter.next() {
            if FLAGS_WITH_VALUE.contains(&arg.as_str()) {
                iter.next();
                continue;
            }
            if !arg.starts_with('-') && is_source_file(arg) {
                sources.push(arg.as_str());
            }
        }
        sources
    }

    /// The `-o` value, handling both `-o out` and `-oout` spellings.
    pub fn output(&self) -> Option<&str> {
        let mut iter = self.args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-o" {
                return iter.next().map(|s| s.as_str());
            }
            if let Some(joined) = arg.strip_prefix("-o")
                && !joined.is_empty()
                && !arg.starts_with("-openmp")
            {
                return Some(joined);
            }
            if FLAGS_WITH_VALUE.contains(&arg.as_str()) {
                iter.next();
            }
        }
        None
    }

    pub fn is_compile_only(&self) -> bool {
        self.args.iter().any(|a| a == "-c")
    }

    /// Refuse invocations the remote path cannot handle: reading from
    /// stdin, or anything that is not a plain `-c` compilation.
    pub fn validate_remote(&self) -> Result<(), ArgvError> {
        if self.args.iter().any(|a| a == "-") {
            return Err(ArgvError::StdinInput);
        }
        if !self.is_compile_only() {
            return Err(ArgvError::Linking);
        }
        if self.source_files().is_empty() {
            return Err(ArgvError::NoSources);
        }
        // A flag at the end of argv with its value missing would silently
        // shift the argument walk on the server.
        if let Some(last) = self.args.last()
            && FLAGS_WITH_VALUE.contains(&last.as_str())
        {
            return Err(ArgvError::MissingValue(last.clone()));
        }
        Ok(())
    }

    /// The argv for a dependency-listing run: original arguments minus the
    /// output and any `-M*` flags the caller set, plus `-M`.
    ///
    /// The listing goes to stdout; `-MT` pins the rule target so the output
    /// shape does not depend on the source name.
    pub fn dependency_argv(&self) -> Vec<String> {
        let mut argv = vec![self.compiler.clone()];
        let mut iter = self.args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-o" || arg == "-MF" || arg == "-MT" || arg == "-MQ" {
                iter.next();
                continue;
            }
            if arg.starts_with("-o") && !arg.starts_with("-openmp") {
                continue;
            }
            if arg.starts_with("-M") {
                continue;
            }
            argv.push(arg.clone());
        }
        argv.push("-M".to_string());
        argv.push("-MT".to_string());
        argv.push("deps".to_string());
        argv
    }
}

/// Whether `arg` names a source file by extension.
pub fn is_source_file(arg: &str) -> bool {
    match arg.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && SOURCE_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// Whether `flag` consumes the next argument as its value.
pub fn flag_takes_value(flag: &str) -> bool {
    FLAGS_WITH_VALUE.contains(&flag)
}
