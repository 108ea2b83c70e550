// Entity extraction
// A single depth-first pass over a tree-sitter parse tree, driven by the
// per-language mapping tables in the language registry. Produces the
// per-file extraction result consumed by the indexer: entities,
// relationships, and file metadata.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tree_sitter::{Node, Tree};

use crate::parsing::{LanguageRegistry, LanguageSpec, SupportedLanguage};
use crate::types::{
    Entity, EntityId, EntityKind, FileId, FileRecord, Fingerprint, Parameter, RelTarget,
    RelationKind, Relationship, Span,
};

/// Bound on stored snippets (embedding + clone-detection input).
const SNIPPET_MAX_CHARS: usize = 600;
/// Bound on stored doc comments.
const DOC_MAX_CHARS: usize = 500;
/// Bound on unresolved call-target names.
const TARGET_MAX_CHARS: usize = 200;

/// Complete per-file extraction output. This is the parse-cache value: a
/// cache hit returns it bit-identical to a fresh extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub file: FileRecord,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    /// Syntax errors encountered; extraction continues around them.
    pub errors: Vec<String>,
}

impl ExtractionResult {
    /// Rough in-memory footprint, used by the parse cache accountant.
    pub fn estimated_bytes(&self) -> usize {
        let mut bytes = 256;
        for entity in &self.entities {
            bytes += 280;
            bytes += entity.name.len()
                + entity.qualified_name.len()
                + entity.snippet.len()
                + entity.doc_comment.as_deref().map_or(0, str::len);
            bytes += entity
                .parameters
                .iter()
                .map(|p| 48 + p.name.len())
                .sum::<usize>();
            bytes += entity.modifiers.iter().map(|m| 16 + m.len()).sum::<usize>();
        }
        for rel in &self.relationships {
            bytes += 96;
            if let RelTarget::Name(name) = &rel.target {
                bytes += name.len();
            }
        }
        bytes + self.errors.iter().map(|e| e.len()).sum::<usize>()
    }
}

/// Language-agnostic entity extractor.
pub struct EntityExtractor;

impl EntityExtractor {
    /// Extract entities and relationships from a parsed file.
    pub fn extract(
        tree: &Tree,
        source: &[u8],
        path: &Path,
        language: SupportedLanguage,
        fingerprint: Fingerprint,
    ) -> ExtractionResult {
        let spec = LanguageRegistry::global()
            .spec(language)
            .expect("extraction requires a registered language");

        let file_id = FileId::from_path(path);
        let mut walker = Walker {
            source,
            path,
            file_id,
            language,
            spec,
            fingerprint,
            entities: Vec::new(),
            relationships: Vec::new(),
            errors: Vec::new(),
            scopes: Vec::new(),
        };
        walker.visit(tree.root_node(), &BTreeSet::new());

        ExtractionResult {
            file: FileRecord {
                id: file_id,
                path: path.to_path_buf(),
                language,
                fingerprint,
                size: source.len() as u64,
                last_seen: Utc::now(),
            },
            entities: walker.entities,
            relationships: walker.relationships,
            errors: walker.errors,
        }
    }
}

/// One enclosing named scope during traversal.
struct Scope {
    id: EntityId,
    qualified: String,
    kind: EntityKind,
}

struct Walker<'a> {
    source: &'a [u8],
    path: &'a Path,
    file_id: FileId,
    language: SupportedLanguage,
    spec: &'static LanguageSpec,
    fingerprint: Fingerprint,
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    errors: Vec<String>,
    scopes: Vec<Scope>,
}

impl<'a> Walker<'a> {
    fn visit(&mut self, node: Node, pending_modifiers: &BTreeSet<String>) {
        if node.is_error() {
            let pos = node.start_position();
            self.errors.push(format!(
                "syntax error at line {}, column {}",
                pos.row + 1,
                pos.column
            ));
        }

        let kind = node.kind();

        // Python decorators wrap the definition; fold decorator names into
        // the inner definition's modifiers.
        if kind == "decorated_definition" {
            let mut modifiers = pending_modifiers.clone();
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "decorator" {
                    if let Some(name) = self.node_text(child).strip_prefix('@') {
                        let simple = name
                            .split(['(', '.'])
                            .next_back()
                            .unwrap_or(name)
                            .trim()
                            .to_lowercase();
                        if !simple.is_empty() {
                            modifiers.insert(simple);
                        }
                    }
                }
            }
            if let Some(definition) = node.child_by_field_name("definition") {
                self.visit(definition, &modifiers);
            }
            return;
        }

        // `export` wrappers pass their keyword down as a modifier; a bare
        // export clause or anonymous default export produces its own entity.
        if kind == "export_statement" {
            self.visit_export(node, pending_modifiers);
            return;
        }

        if self.spec.import_nodes.contains(&kind) {
            self.extract_import(node);
            return;
        }

        if let Some((_, relation)) = self
            .spec
            .call_nodes
            .iter()
            .find(|(call_kind, _)| *call_kind == kind)
        {
            self.extract_call(node, *relation);
            // Arguments may contain nested calls and function literals.
            self.visit_children(node);
            return;
        }

        // Module- and class-level assignments become variables/constants.
        if self.language == SupportedLanguage::Python
            && kind == "assignment"
            && !self.in_callable_scope()
        {
            self.extract_python_assignment(node, pending_modifiers);
            self.visit_children(node);
            return;
        }

        if let Some(entity_kind) = self.entity_kind_for(node) {
            self.extract_entity(node, entity_kind, pending_modifiers);
            return;
        }

        self.visit_children(node);
    }

    fn visit_children(&mut self, node: Node) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            self.visit(child, &BTreeSet::new());
        }
    }

    fn entity_kind_for(&self, node: Node) -> Option<EntityKind> {
        let kind = node.kind();
        let mapped = self
            .spec
            .entity_nodes
            .iter()
            .find(|(node_kind, _)| *node_kind == kind)
            .map(|(_, entity_kind)| *entity_kind)?;

        // Type specifiers without a body are references, not declarations.
        if matches!(
            mapped,
            EntityKind::Struct | EntityKind::Union | EntityKind::Enum | EntityKind::Class
        ) && kind.ends_with("_specifier")
            && node.child_by_field_name("body").is_none()
        {
            return None;
        }

        // Local variables inside function bodies are not indexed.
        if mapped == EntityKind::Variable && self.in_callable_scope() {
            return None;
        }

        Some(mapped)
    }

    fn visit_export(&mut self, node: Node, pending_modifiers: &BTreeSet<String>) {
        let mut modifiers = pending_modifiers.clone();
        modifiers.insert("export".to_string());
        let is_default = self.has_token_child(node, "default");
        if is_default {
            modifiers.insert("default".to_string());
        }

        if let Some(declaration) = node.child_by_field_name("declaration") {
            self.visit(declaration, &modifiers);
            return;
        }

        if let Some(value) = node.child_by_field_name("value") {
            if self.spec.anonymous_fn_nodes.contains(&value.kind()) {
                self.extract_entity(value, EntityKind::Function, &modifiers);
            } else {
                self.visit(value, &modifiers);
            }
            return;
        }

        // `export { a, b }`: a re-export clause without a declaration.
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "export_clause" {
                let mut spec_cursor = child.walk();
                for spec_node in child.children(&mut spec_cursor) {
                    if spec_node.kind() == "export_specifier" {
                        let name = spec_node
                            .child_by_field_name("name")
                            .map(|n| self.node_text(n).to_string())
                            .unwrap_or_default();
                        if !name.is_empty() {
                            self.push_simple_entity(spec_node, EntityKind::Export, name, &modifiers);
                        }
                    }
                }
            }
        }
    }

    fn extract_entity(
        &mut self,
        node: Node,
        mapped_kind: EntityKind,
        pending_modifiers: &BTreeSet<String>,
    ) {
        // Variable declarators holding a function literal are functions.
        let mut kind = mapped_kind;
        let mut body_owner = node;
        if kind == EntityKind::Variable {
            if let Some(value) = node.child_by_field_name("value") {
                if self.spec.anonymous_fn_nodes.contains(&value.kind())
                    || value.kind().contains("function")
                {
                    kind = EntityKind::Function;
                    body_owner = value;
                } else if self.is_const_declaration(node) {
                    kind = EntityKind::Constant;
                }
            } else if self.is_const_declaration(node) {
                kind = EntityKind::Constant;
            }
        }

        // Functions nested directly inside a type scope are methods.
        if kind == EntityKind::Function {
            if let Some(scope) = self.scopes.last() {
                if matches!(
                    scope.kind,
                    EntityKind::Class
                        | EntityKind::Interface
                        | EntityKind::Struct
                        | EntityKind::Union
                        | EntityKind::Enum
                ) {
                    kind = EntityKind::Method;
                }
            }
        }

        let name = self
            .extract_name(node)
            .unwrap_or_else(|| format!("anonymous@{}", node.start_byte()));
        let qualified = self.qualify(&name);
        let span = span_of(node);
        let id = EntityId::new(self.path, kind, &qualified, span.start_byte);

        let mut modifiers = pending_modifiers.clone();
        self.collect_modifiers(node, &mut modifiers);

        let parameters = if kind.is_callable() {
            self.extract_parameters(body_owner)
        } else {
            Vec::new()
        };
        let return_type = if kind.is_callable() {
            self.extract_return_type(body_owner)
        } else {
            None
        };

        let doc_comment = self.extract_doc_comment(node, body_owner);
        let snippet = self.build_snippet(node, doc_comment.as_deref());
        let complexity = body_owner
            .child_by_field_name("body")
            .map(count_nodes)
            .unwrap_or(0);

        let parent_id = self.scopes.last().map(|scope| scope.id);
        if let Some(parent) = parent_id {
            self.relationships.push(Relationship {
                source: parent,
                target: RelTarget::Entity(id),
                kind: RelationKind::Contains,
                file_id: self.file_id,
                span: Some(span),
            });
        }

        self.extract_inheritance(node, id, span);

        self.entities.push(Entity {
            id,
            file_id: self.file_id,
            file_path: self.path.to_path_buf(),
            kind,
            name,
            qualified_name: qualified.clone(),
            language: self.language,
            span,
            modifiers,
            parameters,
            return_type,
            parent_id,
            doc_comment,
            snippet,
            complexity,
            fingerprint: self.fingerprint,
        });

        if kind.is_scope() {
            self.scopes.push(Scope {
                id,
                qualified,
                kind,
            });
            self.visit_children(body_owner);
            self.scopes.pop();
        } else {
            self.visit_children(node);
        }
    }

    fn push_simple_entity(
        &mut self,
        node: Node,
        kind: EntityKind,
        name: String,
        modifiers: &BTreeSet<String>,
    ) {
        let qualified = self.qualify(&name);
        let span = span_of(node);
        let id = EntityId::new(self.path, kind, &qualified, span.start_byte);
        let parent_id = self.scopes.last().map(|scope| scope.id);
        self.entities.push(Entity {
            id,
            file_id: self.file_id,
            file_path: self.path.to_path_buf(),
            kind,
            name,
            qualified_name: qualified,
            language: self.language,
            span,
            modifiers: modifiers.clone(),
            parameters: Vec::new(),
            return_type: None,
            parent_id,
            doc_comment: None,
            snippet: self.build_snippet(node, None),
            complexity: 0,
            fingerprint: self.fingerprint,
        });
    }

    /// Imports produce an `import` entity per imported module and one
    /// unresolved `imports` relationship per imported name.
    fn extract_import(&mut self, node: Node) {
        let span = span_of(node);
        match self.language {
            SupportedLanguage::Python => {
                if node.kind() == "import_statement" {
                    let mut cursor = node.walk();
                    for child in node.children(&mut cursor) {
                        let module = match child.kind() {
                            "dotted_name" => Some(self.node_text(child).to_string()),
                            "aliased_import" => child
                                .child_by_field_name("name")
                                .map(|n| self.node_text(n).to_string()),
                            _ => None,
                        };
                        if let Some(module) = module {
                            let id = self.push_import_entity(child, module.clone());
                            self.push_import_relationship(id, module, span);
                        }
                    }
                } else {
                    // from x import a, b  /  from __future__ import ...
                    let module = node
                        .child_by_field_name("module_name")
                        .map(|n| self.node_text(n).to_string())
                        .unwrap_or_else(|| "__future__".to_string());
                    let id = self.push_import_entity(node, module.clone());
                    let mut emitted = false;
                    let mut cursor = node.walk();
                    for child in node.children(&mut cursor) {
                        if Some(child) == node.child_by_field_name("module_name") {
                            continue;
                        }
                        let imported = match child.kind() {
                            "dotted_name" => Some(self.node_text(child).to_string()),
                            "aliased_import" => child
                                .child_by_field_name("name")
                                .map(|n| self.node_text(n).to_string()),
                            "wildcard_import" => Some("*".to_string()),
                            _ => None,
                        };
                        if let Some(imported) = imported {
                            emitted = true;
                            self.push_import_relationship(id, imported, span);
                        }
                    }
                    if !emitted {
                        self.push_import_relationship(id, module, span);
                    }
                }
            }
            SupportedLanguage::JavaScript
            | SupportedLanguage::TypeScript
            | SupportedLanguage::Tsx => {
                let module = node
                    .child_by_field_name("source")
                    .map(|n| strip_quotes(self.node_text(n)))
                    .unwrap_or_default();
                if module.is_empty() {
                    return;
                }
                let id = self.push_import_entity(node, module.clone());
                let mut emitted = false;
                for name in self.js_imported_names(node) {
                    emitted = true;
                    self.push_import_relationship(id, name, span);
                }
                if !emitted {
                    // Side-effect import: `import './polyfill'`.
                    self.push_import_relationship(id, module, span);
                }
            }
            SupportedLanguage::C | SupportedLanguage::Cpp => {
                let header = node
                    .child_by_field_name("path")
                    .map(|n| strip_quotes(self.node_text(n)))
                    .unwrap_or_default();
                if header.is_empty() {
                    return;
                }
                let id = self.push_import_entity(node, header.clone());
                self.push_import_relationship(id, header, span);
            }
        }
    }

    fn js_imported_names(&self, node: Node) -> Vec<String> {
        let mut names = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let mut cursor = current.walk();
            for child in current.children(&mut cursor) {
                match child.kind() {
                    "import_specifier" => {
                        if let Some(name) = child.child_by_field_name("name") {
                            names.push(self.node_text(name).to_string());
                        }
                    }
                    "namespace_import" => names.push("*".to_string()),
                    "identifier" if current.kind() == "import_clause" => {
                        names.push(self.node_text(child).to_string());
                    }
                    _ => stack.push(child),
                }
            }
        }
        names.reverse();
        names
    }

    fn push_import_entity(&mut self, node: Node, module: String) -> EntityId {
        let span = span_of(node);
        let qualified = self.qualify(&module);
        let id = EntityId::new(self.path, EntityKind::Import, &qualified, span.start_byte);
        self.entities.push(Entity {
            id,
            file_id: self.file_id,
            file_path: self.path.to_path_buf(),
            kind: EntityKind::Import,
            name: module,
            qualified_name: qualified,
            language: self.language,
            span,
            modifiers: BTreeSet::new(),
            parameters: Vec::new(),
            return_type: None,
            parent_id: self.scopes.last().map(|scope| scope.id),
            doc_comment: None,
            snippet: self.build_snippet(node, None),
            complexity: 0,
            fingerprint: self.fingerprint,
        });
        id
    }

    fn push_import_relationship(&mut self, source: EntityId, name: String, span: Span) {
        self.relationships.push(Relationship {
            source,
            target: RelTarget::Name(truncate_chars(&name, TARGET_MAX_CHARS)),
            kind: RelationKind::Imports,
            file_id: self.file_id,
            span: Some(span),
        });
    }

    /// Calls attribute to the innermost enclosing function or method;
    /// module-level invocations carry no source entity and are skipped.
    fn extract_call(&mut self, node: Node, relation: RelationKind) {
        let Some(source) = self
            .scopes
            .iter()
            .rev()
            .find(|scope| scope.kind.is_callable())
            .map(|scope| scope.id)
        else {
            return;
        };

        let callee = node
            .child_by_field_name("function")
            .or_else(|| node.child_by_field_name("constructor"))
            .or_else(|| node.child_by_field_name("type"));
        let Some(callee) = callee else { return };
        let target = normalize_callee(self.node_text(callee));
        if target.is_empty() {
            return;
        }

        self.relationships.push(Relationship {
            source,
            target: RelTarget::Name(truncate_chars(&target, TARGET_MAX_CHARS)),
            kind: relation,
            file_id: self.file_id,
            span: Some(span_of(node)),
        });
    }

    fn extract_python_assignment(&mut self, node: Node, pending_modifiers: &BTreeSet<String>) {
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        if left.kind() != "identifier" {
            return;
        }
        let name = self.node_text(left).to_string();
        let kind = if name.chars().all(|c| !c.is_lowercase()) && name.len() > 1 {
            EntityKind::Constant
        } else {
            EntityKind::Variable
        };
        self.push_simple_entity(node, kind, name, pending_modifiers);
    }

    fn extract_inheritance(&mut self, node: Node, entity: EntityId, span: Span) {
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let mut cursor = current.walk();
            for child in current.children(&mut cursor) {
                let child_kind = child.kind();
                if self.spec.extends_nodes.contains(&child_kind) {
                    // Python superclass lists are plain argument lists; only
                    // the one in the `superclasses` field counts.
                    if self.language == SupportedLanguage::Python
                        && node.child_by_field_name("superclasses") != Some(child)
                    {
                        continue;
                    }
                    for base in self.clause_type_names(child) {
                        self.relationships.push(Relationship {
                            source: entity,
                            target: RelTarget::Name(base),
                            kind: RelationKind::Extends,
                            file_id: self.file_id,
                            span: Some(span),
                        });
                    }
                } else if self.spec.implements_nodes.contains(&child_kind) {
                    for base in self.clause_type_names(child) {
                        self.relationships.push(Relationship {
                            source: entity,
                            target: RelTarget::Name(base),
                            kind: RelationKind::Implements,
                            file_id: self.file_id,
                            span: Some(span),
                        });
                    }
                } else if child_kind == "class_heritage" {
                    // JS keeps extends inside class_heritage without a
                    // dedicated clause node; TS nests clauses beneath it.
                    stack.push(child);
                }
            }
        }
    }

    fn clause_type_names(&self, clause: Node) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor = clause.walk();
        for child in clause.children(&mut cursor) {
            match child.kind() {
                "identifier" | "type_identifier" | "attribute" | "member_expression"
                | "scoped_type_identifier" | "qualified_identifier" | "generic_type" => {
                    let text = self.node_text(child);
                    let base = text.split('<').next().unwrap_or(text).trim();
                    if !base.is_empty() {
                        names.push(base.to_string());
                    }
                }
                "base_class_clause" => names.extend(self.clause_type_names(child)),
                _ => {}
            }
        }
        names
    }

    fn extract_parameters(&self, node: Node) -> Vec<Parameter> {
        let Some(params) = self.parameter_list(node) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cursor = params.walk();
        for child in params.named_children(&mut cursor) {
            match child.kind() {
                "identifier" | "type_identifier" => out.push(Parameter {
                    name: self.node_text(child).to_string(),
                    type_hint: None,
                    default_value: None,
                    variadic: false,
                }),
                "typed_parameter" | "typed_default_parameter" => {
                    let name = child
                        .named_child(0)
                        .filter(|n| n.kind() == "identifier")
                        .or_else(|| child.child_by_field_name("name"))
                        .map(|n| self.node_text(n).to_string())
                        .unwrap_or_default();
                    out.push(Parameter {
                        name,
                        type_hint: child
                            .child_by_field_name("type")
                            .map(|n| self.node_text(n).to_string()),
                        default_value: child
                            .child_by_field_name("value")
                            .map(|n| self.node_text(n).to_string()),
                        variadic: false,
                    });
                }
                "default_parameter" => out.push(Parameter {
                    name: child
                        .child_by_field_name("name")
                        .map(|n| self.node_text(n).to_string())
                        .unwrap_or_default(),
                    type_hint: None,
                    default_value: child
                        .child_by_field_name("value")
                        .map(|n| self.node_text(n).to_string()),
                    variadic: false,
                }),
                "required_parameter" | "optional_parameter" => out.push(Parameter {
                    name: child
                        .child_by_field_name("pattern")
                        .map(|n| self.node_text(n).to_string())
                        .unwrap_or_default(),
                    type_hint: child
                        .child_by_field_name("type")
                        .map(|n| trim_type_annotation(self.node_text(n))),
                    default_value: child
                        .child_by_field_name("value")
                        .map(|n| self.node_text(n).to_string()),
                    variadic: child
                        .child_by_field_name("pattern")
                        .map(|n| n.kind() == "rest_pattern")
                        .unwrap_or(false),
                }),
                "assignment_pattern" => out.push(Parameter {
                    name: child
                        .child_by_field_name("left")
                        .map(|n| self.node_text(n).to_string())
                        .unwrap_or_default(),
                    type_hint: None,
                    default_value: child
                        .child_by_field_name("right")
                        .map(|n| self.node_text(n).to_string()),
                    variadic: false,
                }),
                "parameter_declaration" | "optional_parameter_declaration" => {
                    let name = child
                        .child_by_field_name("declarator")
                        .map(|d| self.declarator_name(d))
                        .unwrap_or_default();
                    out.push(Parameter {
                        name,
                        type_hint: child
                            .child_by_field_name("type")
                            .map(|n| self.node_text(n).to_string()),
                        default_value: child
                            .child_by_field_name("default_value")
                            .map(|n| self.node_text(n).to_string()),
                        variadic: false,
                    });
                }
                kind if self.spec.variadic_param_nodes.contains(&kind) => {
                    let name = child
                        .named_child(0)
                        .map(|n| self.node_text(n).to_string())
                        .unwrap_or_else(|| self.node_text(child).to_string());
                    out.push(Parameter {
                        name,
                        type_hint: None,
                        default_value: None,
                        variadic: true,
                    });
                }
                _ => {}
            }
        }
        out
    }

    fn parameter_list(&self, node: Node<'a>) -> Option<Node<'a>> {
        if let Some(params) = node.child_by_field_name("parameters") {
            return Some(params);
        }
        // C-family: parameters hang off the function declarator chain.
        let mut declarator = node.child_by_field_name("declarator");
        while let Some(current) = declarator {
            if let Some(params) = current.child_by_field_name("parameters") {
                return Some(params);
            }
            declarator = current.child_by_field_name("declarator");
        }
        // Single-parameter arrow functions: `x => x + 1`.
        node.child_by_field_name("parameter")
    }

    fn extract_return_type(&self, node: Node) -> Option<String> {
        if let Some(rt) = node.child_by_field_name("return_type") {
            return Some(trim_type_annotation(self.node_text(rt)));
        }
        if matches!(self.language, SupportedLanguage::C | SupportedLanguage::Cpp) {
            if let Some(ty) = node.child_by_field_name("type") {
                return Some(self.node_text(ty).to_string());
            }
        }
        None
    }

    fn extract_name(&self, node: Node) -> Option<String> {
        // Class fields use `property`, everything else `name`.
        for field in ["name", "property"] {
            if let Some(name) = node.child_by_field_name(field) {
                let text = self.node_text(name).trim();
                if !text.is_empty() {
                    // C++ out-of-line definitions: keep the last path segment.
                    return Some(last_scope_segment(text).to_string());
                }
            }
        }
        if let Some(declarator) = node.child_by_field_name("declarator") {
            let name = self.declarator_name(declarator);
            if !name.is_empty() {
                return Some(name);
            }
        }
        if node.kind() == "assignment" {
            if let Some(left) = node.child_by_field_name("left") {
                if left.kind() == "identifier" {
                    return Some(self.node_text(left).to_string());
                }
            }
        }
        None
    }

    /// Walk a C-family declarator chain down to the declared identifier.
    fn declarator_name(&self, declarator: Node) -> String {
        let mut current = declarator;
        loop {
            match current.kind() {
                "identifier" | "field_identifier" | "type_identifier" | "operator_name"
                | "destructor_name" => return self.node_text(current).to_string(),
                "qualified_identifier" => {
                    let text = self.node_text(current);
                    return last_scope_segment(text).to_string();
                }
                _ => {}
            }
            if let Some(inner) = current.child_by_field_name("declarator") {
                current = inner;
                continue;
            }
            // Fall back to the first identifier-ish descendant.
            let mut cursor = current.walk();
            let mut next = None;
            for child in current.children(&mut cursor) {
                if matches!(
                    child.kind(),
                    "identifier" | "field_identifier" | "type_identifier" | "qualified_identifier"
                ) {
                    next = Some(child);
                    break;
                }
            }
            match next {
                Some(child) => current = child,
                None => return String::new(),
            }
        }
    }

    fn collect_modifiers(&self, node: Node, modifiers: &mut BTreeSet<String>) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            let kind = child.kind();
            if self.spec.modifier_tokens.contains(&kind) {
                modifiers.insert(kind.to_lowercase());
                continue;
            }
            // Visibility and storage-class wrappers carry the token as text.
            if matches!(
                kind,
                "accessibility_modifier" | "storage_class_specifier" | "type_qualifier"
                    | "virtual_specifier"
            ) {
                let text = self.node_text(child).trim().to_lowercase();
                if self.spec.modifier_tokens.contains(&text.as_str()) {
                    modifiers.insert(text);
                }
            }
        }
    }

    fn extract_doc_comment(&self, node: Node, body_owner: Node) -> Option<String> {
        if self.language == SupportedLanguage::Python {
            let body = body_owner.child_by_field_name("body")?;
            let first = body.named_child(0)?;
            if first.kind() == "expression_statement" {
                let string = first.named_child(0)?;
                if string.kind() == "string" {
                    let text = strip_quotes(self.node_text(string));
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        return Some(truncate_chars(trimmed, DOC_MAX_CHARS));
                    }
                }
            }
            return None;
        }

        let prev = node.prev_named_sibling()?;
        if prev.kind() == "comment" {
            let text = self.node_text(prev);
            if text.starts_with("/**") || text.starts_with("///") || text.starts_with("/*") {
                let cleaned = clean_block_comment(text);
                if !cleaned.is_empty() {
                    return Some(truncate_chars(&cleaned, DOC_MAX_CHARS));
                }
            }
        }
        None
    }

    fn build_snippet(&self, node: Node, doc: Option<&str>) -> String {
        let declaration = self.node_text(node);
        match doc {
            Some(doc) => {
                let mut snippet = String::with_capacity(doc.len() + declaration.len() + 1);
                snippet.push_str(doc);
                snippet.push('\n');
                snippet.push_str(declaration);
                truncate_chars(&snippet, SNIPPET_MAX_CHARS)
            }
            None => truncate_chars(declaration, SNIPPET_MAX_CHARS),
        }
    }

    fn qualify(&self, name: &str) -> String {
        match self.scopes.last() {
            Some(scope) => format!(
                "{}{}{}",
                scope.qualified,
                self.language.scope_separator(),
                name
            ),
            None => name.to_string(),
        }
    }

    fn in_callable_scope(&self) -> bool {
        self.scopes.iter().any(|scope| scope.kind.is_callable())
    }

    fn is_const_declaration(&self, declarator: Node) -> bool {
        declarator
            .parent()
            .map(|parent| self.has_token_child(parent, "const"))
            .unwrap_or(false)
    }

    fn has_token_child(&self, node: Node, token: &str) -> bool {
        let mut cursor = node.walk();
        let found = node.children(&mut cursor).any(|child| child.kind() == token);
        found
    }

    fn node_text(&self, node: Node) -> &str {
        node.utf8_text(self.source).unwrap_or("")
    }
}

fn span_of(node: Node) -> Span {
    let start = node.start_position();
    let end = node.end_position();
    Span {
        start_line: start.row as u32 + 1,
        start_column: start.column as u32,
        start_byte: node.start_byte() as u32,
        end_line: end.row as u32 + 1,
        end_column: end.column as u32,
        end_byte: node.end_byte() as u32,
    }
}

fn count_nodes(node: Node) -> u32 {
    let mut count = 1u32;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        count += count_nodes(child);
    }
    count
}

fn strip_quotes(text: &str) -> String {
    let trimmed = text.trim();
    let trimmed = trimmed
        .trim_start_matches(|c| c == '"' || c == '\'' || c == '`' || c == '<')
        .trim_end_matches(|c| c == '"' || c == '\'' || c == '`' || c == '>');
    // Python triple-quoted strings and prefixes.
    let trimmed = trimmed.trim_start_matches("\"\"").trim_end_matches("\"\"");
    trimmed.to_string()
}

fn clean_block_comment(text: &str) -> String {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches("/**")
                .trim_start_matches("/*")
                .trim_start_matches("*/")
                .trim_start_matches("///")
                .trim_start_matches("//")
                .trim_start_matches('*')
                .trim()
        })
        .filter(|line| !line.is_empty() && *line != "/")
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end_matches("*/")
        .trim()
        .to_string()
}

fn normalize_callee(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join("")
}

fn last_scope_segment(text: &str) -> &str {
    text.rsplit("::").next().unwrap_or(text).trim()
}

fn trim_type_annotation(text: &str) -> String {
    text.trim_start_matches([':', '-', '>']).trim().to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}
