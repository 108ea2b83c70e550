// Language registry for multi-language parsing
// Each supported language contributes a tree-sitter grammar plus a node-type
// mapping table and keyword set that drive the entity extractor. Adding a
// language is limited to exactly those three pieces.

use anyhow::Result;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tree_sitter::Language;

use crate::types::{EntityKind, RelationKind};

/// Supported programming languages for parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedLanguage {
    JavaScript,
    TypeScript,
    Tsx,
    Python,
    C,
    Cpp,
}

impl SupportedLanguage {
    /// Get the tree-sitter grammar for this language.
    pub fn tree_sitter_language(&self) -> Result<Language> {
        match self {
            SupportedLanguage::JavaScript => Ok(tree_sitter_javascript::LANGUAGE.into()),
            SupportedLanguage::TypeScript => {
                Ok(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into())
            }
            SupportedLanguage::Tsx => Ok(tree_sitter_typescript::LANGUAGE_TSX.into()),
            SupportedLanguage::Python => Ok(tree_sitter_python::LANGUAGE.into()),
            SupportedLanguage::C => Ok(tree_sitter_c::LANGUAGE.into()),
            SupportedLanguage::Cpp => Ok(tree_sitter_cpp::LANGUAGE.into()),
        }
    }

    /// Detect language from a file extension.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_lowercase().as_str() {
            "js" | "mjs" | "cjs" | "jsx" => Some(SupportedLanguage::JavaScript),
            "ts" | "mts" | "cts" => Some(SupportedLanguage::TypeScript),
            "tsx" => Some(SupportedLanguage::Tsx),
            "py" | "pyi" => Some(SupportedLanguage::Python),
            "c" | "h" => Some(SupportedLanguage::C),
            "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" => Some(SupportedLanguage::Cpp),
            _ => None,
        }
    }

    /// Parse a language from a string name or common abbreviation.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "javascript" | "js" => Some(SupportedLanguage::JavaScript),
            "typescript" | "ts" => Some(SupportedLanguage::TypeScript),
            "tsx" | "jsx" => Some(SupportedLanguage::Tsx),
            "python" | "py" => Some(SupportedLanguage::Python),
            "c" => Some(SupportedLanguage::C),
            "cpp" | "c++" | "cxx" => Some(SupportedLanguage::Cpp),
            _ => None,
        }
    }

    /// Stable tag mixed into content fingerprints and stored on entities.
    pub fn tag(&self) -> &'static str {
        match self {
            SupportedLanguage::JavaScript => "javascript",
            SupportedLanguage::TypeScript => "typescript",
            SupportedLanguage::Tsx => "tsx",
            SupportedLanguage::Python => "python",
            SupportedLanguage::C => "c",
            SupportedLanguage::Cpp => "cpp",
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            SupportedLanguage::JavaScript => "JavaScript",
            SupportedLanguage::TypeScript => "TypeScript",
            SupportedLanguage::Tsx => "TSX",
            SupportedLanguage::Python => "Python",
            SupportedLanguage::C => "C",
            SupportedLanguage::Cpp => "C++",
        }
    }

    /// File extensions claimed by this language.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            SupportedLanguage::JavaScript => &["js", "mjs", "cjs", "jsx"],
            SupportedLanguage::TypeScript => &["ts", "mts", "cts"],
            SupportedLanguage::Tsx => &["tsx"],
            SupportedLanguage::Python => &["py", "pyi"],
            SupportedLanguage::C => &["c", "h"],
            SupportedLanguage::Cpp => &["cc", "cpp", "cxx", "hpp", "hh", "hxx"],
        }
    }

    /// Separator used when joining enclosing scopes into a qualified name.
    pub fn scope_separator(&self) -> &'static str {
        match self {
            SupportedLanguage::C | SupportedLanguage::Cpp => "::",
            _ => ".",
        }
    }
}

impl std::fmt::Display for SupportedLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Node-type mapping table and keyword set for one language.
///
/// The extractor is generic; everything language-specific lives here.
#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub language: SupportedLanguage,
    /// AST node kind → entity kind for declaration nodes.
    pub entity_nodes: &'static [(&'static str, EntityKind)],
    /// Invocation node kinds and the relationship they produce.
    pub call_nodes: &'static [(&'static str, RelationKind)],
    /// Import statement node kinds.
    pub import_nodes: &'static [&'static str],
    /// Node kinds that declare base classes (`extends`).
    pub extends_nodes: &'static [&'static str],
    /// Node kinds that declare implemented interfaces.
    pub implements_nodes: &'static [&'static str],
    /// Keyword set collected verbatim (lowercased) as modifiers.
    pub modifier_tokens: &'static [&'static str],
    /// Parameter node kinds that represent variadic forms.
    pub variadic_param_nodes: &'static [&'static str],
    /// Anonymous-function node kinds extracted only in naming positions.
    pub anonymous_fn_nodes: &'static [&'static str],
}

static JAVASCRIPT_SPEC: LanguageSpec = LanguageSpec {
    language: SupportedLanguage::JavaScript,
    entity_nodes: &[
        ("function_declaration", EntityKind::Function),
        ("generator_function_declaration", EntityKind::Function),
        ("method_definition", EntityKind::Method),
        ("class_declaration", EntityKind::Class),
        ("variable_declarator", EntityKind::Variable),
        ("field_definition", EntityKind::Field),
        ("public_field_definition", EntityKind::Field),
    ],
    call_nodes: &[
        ("call_expression", RelationKind::Calls),
        ("new_expression", RelationKind::Instantiates),
    ],
    import_nodes: &["import_statement"],
    extends_nodes: &["class_heritage"],
    implements_nodes: &[],
    modifier_tokens: &["async", "static", "get", "set", "export", "default"],
    variadic_param_nodes: &["rest_pattern"],
    anonymous_fn_nodes: &["arrow_function", "function_expression"],
};

static TYPESCRIPT_SPEC: LanguageSpec = LanguageSpec {
    language: SupportedLanguage::TypeScript,
    entity_nodes: &[
        ("function_declaration", EntityKind::Function),
        ("generator_function_declaration", EntityKind::Function),
        ("method_definition", EntityKind::Method),
        ("class_declaration", EntityKind::Class),
        ("abstract_class_declaration", EntityKind::Class),
        ("interface_declaration", EntityKind::Interface),
        ("type_alias_declaration", EntityKind::Type),
        ("enum_declaration", EntityKind::Enum),
        ("internal_module", EntityKind::Namespace),
        ("variable_declarator", EntityKind::Variable),
        ("public_field_definition", EntityKind::Field),
        ("property_signature", EntityKind::Field),
    ],
    call_nodes: &[
        ("call_expression", RelationKind::Calls),
        ("new_expression", RelationKind::Instantiates),
    ],
    import_nodes: &["import_statement"],
    extends_nodes: &["extends_clause", "extends_type_clause"],
    implements_nodes: &["implements_clause"],
    modifier_tokens: &[
        "async", "static", "get", "set", "export", "default", "abstract", "public", "private",
        "protected", "readonly", "declare", "override",
    ],
    variadic_param_nodes: &["rest_pattern"],
    anonymous_fn_nodes: &["arrow_function", "function_expression"],
};

static PYTHON_SPEC: LanguageSpec = LanguageSpec {
    language: SupportedLanguage::Python,
    entity_nodes: &[
        ("function_definition", EntityKind::Function),
        ("class_definition", EntityKind::Class),
    ],
    call_nodes: &[("call", RelationKind::Calls)],
    import_nodes: &[
        "import_statement",
        "import_from_statement",
        "future_import_statement",
    ],
    extends_nodes: &["argument_list"],
    implements_nodes: &[],
    modifier_tokens: &["async", "staticmethod", "classmethod", "property", "abstractmethod"],
    variadic_param_nodes: &["list_splat_pattern", "dictionary_splat_pattern"],
    anonymous_fn_nodes: &["lambda"],
};

static C_SPEC: LanguageSpec = LanguageSpec {
    language: SupportedLanguage::C,
    entity_nodes: &[
        ("function_definition", EntityKind::Function),
        ("struct_specifier", EntityKind::Struct),
        ("union_specifier", EntityKind::Union),
        ("enum_specifier", EntityKind::Enum),
        ("type_definition", EntityKind::Type),
        ("preproc_def", EntityKind::Macro),
        ("preproc_function_def", EntityKind::Macro),
        ("field_declaration", EntityKind::Field),
    ],
    call_nodes: &[("call_expression", RelationKind::Calls)],
    import_nodes: &["preproc_include"],
    extends_nodes: &[],
    implements_nodes: &[],
    modifier_tokens: &["static", "extern", "inline", "const", "volatile", "register"],
    variadic_param_nodes: &["variadic_parameter"],
    anonymous_fn_nodes: &[],
};

static CPP_SPEC: LanguageSpec = LanguageSpec {
    language: SupportedLanguage::Cpp,
    entity_nodes: &[
        ("function_definition", EntityKind::Function),
        ("class_specifier", EntityKind::Class),
        ("struct_specifier", EntityKind::Struct),
        ("union_specifier", EntityKind::Union),
        ("enum_specifier", EntityKind::Enum),
        ("type_definition", EntityKind::Type),
        ("alias_declaration", EntityKind::Type),
        ("namespace_definition", EntityKind::Namespace),
        ("preproc_def", EntityKind::Macro),
        ("preproc_function_def", EntityKind::Macro),
        ("field_declaration", EntityKind::Field),
    ],
    call_nodes: &[
        ("call_expression", RelationKind::Calls),
        ("new_expression", RelationKind::Instantiates),
    ],
    import_nodes: &["preproc_include"],
    extends_nodes: &["base_class_clause"],
    implements_nodes: &[],
    modifier_tokens: &[
        "static", "extern", "inline", "const", "constexpr", "virtual", "override", "final",
        "explicit", "mutable", "volatile",
    ],
    variadic_param_nodes: &["variadic_parameter"],
    anonymous_fn_nodes: &["lambda_expression"],
};

/// Runtime-pluggable registry of language specs.
///
/// The built-in languages are registered at first use; callers may register
/// additional specs before indexing begins.
pub struct LanguageRegistry {
    specs: RwLock<HashMap<SupportedLanguage, &'static LanguageSpec>>,
}

impl LanguageRegistry {
    fn with_builtins() -> Self {
        let mut specs: HashMap<SupportedLanguage, &'static LanguageSpec> = HashMap::new();
        specs.insert(SupportedLanguage::JavaScript, &JAVASCRIPT_SPEC);
        specs.insert(SupportedLanguage::TypeScript, &TYPESCRIPT_SPEC);
        // TSX shares the TypeScript mapping table; only the grammar differs.
        specs.insert(SupportedLanguage::Tsx, &TYPESCRIPT_SPEC);
        specs.insert(SupportedLanguage::Python, &PYTHON_SPEC);
        specs.insert(SupportedLanguage::C, &C_SPEC);
        specs.insert(SupportedLanguage::Cpp, &CPP_SPEC);
        Self {
            specs: RwLock::new(specs),
        }
    }

    /// Process-wide registry instance.
    pub fn global() -> &'static LanguageRegistry {
        static REGISTRY: Lazy<LanguageRegistry> = Lazy::new(LanguageRegistry::with_builtins);
        &REGISTRY
    }

    pub fn register(&self, language: SupportedLanguage, spec: &'static LanguageSpec) {
        self.specs.write().insert(language, spec);
    }

    pub fn spec(&self, language: SupportedLanguage) -> Option<&'static LanguageSpec> {
        self.specs.read().get(&language).copied()
    }

    /// Detect the language of a path from its extension, if registered.
    pub fn detect(&self, path: &Path) -> Option<SupportedLanguage> {
        let extension = path.extension()?.to_str()?;
        let language = SupportedLanguage::from_extension(extension)?;
        if self.specs.read().contains_key(&language) {
            Some(language)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_detection() {
        assert_eq!(
            SupportedLanguage::from_extension("py"),
            Some(SupportedLanguage::Python)
        );
        assert_eq!(
            SupportedLanguage::from_extension("tsx"),
            Some(SupportedLanguage::Tsx)
        );
        assert_eq!(
            SupportedLanguage::from_extension("hpp"),
            Some(SupportedLanguage::Cpp)
        );
        assert_eq!(SupportedLanguage::from_extension("rb"), None);
    }

    #[test]
    fn scope_separators() {
        assert_eq!(SupportedLanguage::Python.scope_separator(), ".");
        assert_eq!(SupportedLanguage::Cpp.scope_separator(), "::");
    }

    #[test]
    fn registry_detects_registered_languages() {
        let registry = LanguageRegistry::global();
        assert_eq!(
            registry.detect(Path::new("src/app.ts")),
            Some(SupportedLanguage::TypeScript)
        );
        assert_eq!(registry.detect(Path::new("README.md")), None);
        assert!(registry.spec(SupportedLanguage::Python).is_some());
    }

    #[test]
    fn grammars_load_for_all_builtins() {
        for language in [
            SupportedLanguage::JavaScript,
            SupportedLanguage::TypeScript,
            SupportedLanguage::Tsx,
            SupportedLanguage::Python,
            SupportedLanguage::C,
            SupportedLanguage::Cpp,
        ] {
            assert!(language.tree_sitter_language().is_ok(), "{language}");
        }
    }
}
