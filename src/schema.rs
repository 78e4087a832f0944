//! Declarative registry of index fields, facets, sorts, relations and
//! citation formats.
//!
//! Specs are collected in a mutable [`Composer`] during startup and frozen
//! into an immutable [`Registry`], which owns the tantivy [`Schema`] built
//! from them. Changing the registry after an index exists means the index
//! must be rebuilt; [`crate::index::SearchIndex`] detects the mismatch.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tantivy::{
    Index,
    TantivyDocument,
    schema::{
        FAST,
        Field,
        INDEXED,
        IndexRecordOption,
        STORED,
        STRING,
        Schema,
        TextFieldIndexing,
        TextOptions,
        Value as _,
    },
    tokenizer::{
        AsciiFoldingFilter,
        Language,
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::{
    codec::{FacetCodec, FieldCodec, PATH_SEPARATOR, QueryOperator, Stored},
    config::Config,
    error::{Error, Result},
    extract::{
        AllDataText,
        BoxedExtractor,
        Chain,
        ChildOutput,
        Children,
        CollectionNames,
        CollectionTree,
        Creators,
        CreatorsSortKey,
        DataField,
        Exists,
        Extractor,
        ItemType,
        ItemTypeLabel,
        ItemView,
        Key,
        MetaField,
        Multi,
        Relations,
        Rendered,
        SortDate,
        SortTitle,
        Tags,
        Transform,
        Transformer,
        Version,
        Year,
    },
    library::LibraryContext,
    record::{ATTACHMENT, Format},
    tag_gate::TagGate,
};

/// Analyzer for searchable text: stemmed and accent-folded.
pub const TEXT_ANALYZER: &str = "bibdex_text";
/// Analyzer for personal names: like [`TEXT_ANALYZER`] without stemming.
pub const NAME_ANALYZER: &str = "bibdex_name";

/// Key of the field holding the item key.
pub const ID_FIELD: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Unique item key, indexed verbatim and stored.
    Id,
    /// Zero or more verbatim terms, stored. Used for filters, sorting and
    /// identifier lookups.
    Keyword,
    /// Analyzed full text, searchable but not stored.
    Text,
    /// Analyzed personal names, searchable but not stored.
    Name,
    /// Stored only.
    Stored,
    Boolean,
    Integer,
}

impl FieldType {
    fn default_codec(self) -> FieldCodec {
        match self {
            Self::Id | Self::Text | Self::Name | Self::Stored => FieldCodec::Text,
            Self::Keyword => FieldCodec::List,
            Self::Boolean => FieldCodec::Bool,
            Self::Integer => FieldCodec::Integer,
        }
    }

    pub fn is_searchable(self) -> bool {
        matches!(self, Self::Text | Self::Name)
    }
}

#[derive(Debug)]
pub struct FieldSpec {
    pub key: String,
    pub field_type: FieldType,
    pub extractor: BoxedExtractor,
    pub codec: FieldCodec,
    /// Keyword scopes the field takes part in.
    pub scopes: Vec<String>,
    pub boost: Option<f32>,
}

impl FieldSpec {
    pub fn new(key: &str, field_type: FieldType, extractor: impl Extractor + 'static) -> Self {
        Self {
            key: key.to_string(),
            field_type,
            extractor: Box::new(extractor),
            codec: field_type.default_codec(),
            scopes: Vec::new(),
            boost: None,
        }
    }

    pub fn codec(mut self, codec: FieldCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn boost(mut self, boost: f32) -> Self {
        self.boost = Some(boost);
        self
    }

    pub fn in_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Run the extractor and, when it yields a value, encode it into
    /// `document`. Returns whether anything was written.
    pub fn extract_and_store(
        &self,
        document: &mut TantivyDocument,
        field: Field,
        view: &ItemView<'_>,
        library: &LibraryContext,
    ) -> bool {
        let Some(value) = self.extractor.extract(view, library) else {
            return false;
        };
        let Some(encoded) = self.codec.encode(&value) else {
            return false;
        };
        for stored in encoded {
            match (self.field_type, stored) {
                (FieldType::Boolean, Stored::Bool(b)) => document.add_bool(field, b),
                (FieldType::Integer, Stored::U64(n)) => document.add_u64(field, n),
                (FieldType::Boolean | FieldType::Integer, _) => {}
                (_, other) => document.add_text(field, other.to_term()),
            }
        }
        true
    }

    pub fn decode(&self, stored: &[Stored]) -> Value {
        self.codec.decode(stored)
    }
}

/// Shape of a facet and how its values nest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacetKind {
    Flat,
    /// Values are paths whose levels are split on `separator`.
    Tree { separator: char },
    /// A tree of the sub-collections of one library collection.
    Collection { collection: String },
}

impl FacetKind {
    pub fn separator(&self) -> Option<char> {
        match self {
            Self::Flat => None,
            Self::Tree { separator } => Some(*separator),
            Self::Collection { .. } => Some(PATH_SEPARATOR),
        }
    }
}

/// Keys facet values are ordered by, most significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetSortKey {
    Count,
    Label,
}

#[derive(Debug)]
pub struct FacetSpec {
    pub key: String,
    pub kind: FacetKind,
    pub title: String,
    /// Name of the filter in the search criteria.
    pub filter_key: String,
    /// Display order among facets; lower comes first.
    pub weight: i32,
    pub extractor: BoxedExtractor,
    pub codec: FacetCodec,
    /// Label of the bucket for documents without a value; no bucket when
    /// unset.
    pub missing_label: Option<String>,
    pub sort_by: Vec<FacetSortKey>,
    pub sort_reverse: bool,
    /// Whether a document may count towards several values at once.
    pub allow_overlap: bool,
    pub operator: QueryOperator,
    /// Whether the facet is shown on item detail views.
    pub item_view: bool,
}

impl FacetSpec {
    pub fn new(
        key: &str,
        kind: FacetKind,
        title: &str,
        filter_key: &str,
        extractor: impl Extractor + 'static,
        codec: FacetCodec,
    ) -> Self {
        let operator = codec.default_operator();
        Self {
            key: key.to_string(),
            kind,
            title: title.to_string(),
            filter_key: filter_key.to_string(),
            weight: 0,
            extractor: Box::new(extractor),
            codec,
            missing_label: None,
            sort_by: vec![FacetSortKey::Count, FacetSortKey::Label],
            sort_reverse: false,
            allow_overlap: true,
            operator,
            item_view: true,
        }
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn missing_label(mut self, label: &str) -> Self {
        self.missing_label = Some(label.to_string());
        self
    }

    pub fn sort(mut self, keys: &[FacetSortKey], reverse: bool) -> Self {
        self.sort_by = keys.to_vec();
        self.sort_reverse = reverse;
        self
    }

    pub fn allow_overlap(mut self, allow: bool) -> Self {
        self.allow_overlap = allow;
        self
    }

    pub fn item_view(mut self, visible: bool) -> Self {
        self.item_view = visible;
        self
    }

    pub fn is_tree(&self) -> bool {
        self.kind.separator().is_some()
    }

    pub fn extract_and_store(
        &self,
        document: &mut TantivyDocument,
        field: Field,
        view: &ItemView<'_>,
        library: &LibraryContext,
    ) -> bool {
        let Some(value) = self.extractor.extract(view, library) else {
            return false;
        };
        let terms = self.codec.encode(&value);
        for term in &terms {
            document.add_text(field, term);
        }
        !terms.is_empty()
    }

    /// `(value, label)` of a stored term; the empty term is the missing
    /// bucket.
    pub fn decode(&self, stored: &str) -> (String, String) {
        self.codec
            .decode(stored, "", self.missing_label.as_deref().unwrap_or(""))
    }
}

/// When a sort option may be offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortCondition {
    Always,
    /// Only when the query has keywords, as relevance means nothing
    /// otherwise.
    WithKeywords,
}

#[derive(Debug, Clone)]
pub struct SortSpec {
    pub key: String,
    pub label: String,
    pub weight: i32,
    /// Keyword fields compared in order; empty sorts by relevance score.
    pub fields: Vec<String>,
    /// One flag per field, or a single flag shared by all fields.
    pub reverse: Vec<bool>,
    pub condition: SortCondition,
}

impl SortSpec {
    pub fn score(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            weight: 0,
            fields: Vec::new(),
            reverse: Vec::new(),
            condition: SortCondition::WithKeywords,
        }
    }

    pub fn by_fields(key: &str, label: &str, fields: &[&str], reverse: &[bool]) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            weight: 0,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            reverse: reverse.to_vec(),
            condition: SortCondition::Always,
        }
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn is_score(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_reversed(&self, position: usize) -> bool {
        match self.reverse.as_slice() {
            [] => false,
            [shared] => *shared,
            flags => flags.get(position).copied().unwrap_or(false),
        }
    }

    pub fn is_allowed(&self, has_keywords: bool) -> bool {
        match self.condition {
            SortCondition::Always => true,
            SortCondition::WithKeywords => has_keywords,
        }
    }
}

/// Backlink side of a directed relation.
#[derive(Debug, Clone)]
pub struct ReverseRelation {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct RelationSpec {
    pub key: String,
    pub label: String,
    /// Keyword field holding identifiers of related items.
    pub field: String,
    /// Keyword fields those identifiers are matched against.
    pub id_fields: Vec<String>,
    pub directed: bool,
    pub reverse: Option<ReverseRelation>,
}

#[derive(Debug, Clone)]
pub struct CitationFormatSpec {
    pub key: String,
    pub label: String,
    pub mime_type: String,
    pub extension: String,
    /// Format requested from the remote.
    pub format: Format,
    /// Stored field the rendered citation is kept in.
    pub field: String,
}

/// A keyword scope users may restrict a search to.
#[derive(Debug, Clone)]
pub struct ScopeSpec {
    pub key: String,
    pub label: String,
    pub weight: i32,
}

/// Mutable collection of specs, used while configuring.
#[derive(Debug, Default)]
pub struct Composer {
    fields: BTreeMap<String, FieldSpec>,
    facets: BTreeMap<String, FacetSpec>,
    sorts: BTreeMap<String, SortSpec>,
    relations: BTreeMap<String, RelationSpec>,
    citation_formats: BTreeMap<String, CitationFormatSpec>,
    scopes: BTreeMap<String, ScopeSpec>,
    stem_language: Option<Language>,
    boolean_operators: BTreeMap<String, String>,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_field(&mut self, spec: FieldSpec) -> &mut Self {
        self.fields.insert(spec.key.clone(), spec);
        self
    }

    pub fn register_facet(&mut self, spec: FacetSpec) -> &mut Self {
        self.facets.insert(spec.key.clone(), spec);
        self
    }

    pub fn register_sort(&mut self, spec: SortSpec) -> &mut Self {
        self.sorts.insert(spec.key.clone(), spec);
        self
    }

    pub fn register_relation(&mut self, spec: RelationSpec) -> &mut Self {
        self.relations.insert(spec.key.clone(), spec);
        self
    }

    pub fn register_citation_format(&mut self, spec: CitationFormatSpec) -> &mut Self {
        self.citation_formats.insert(spec.key.clone(), spec);
        self
    }

    pub fn register_scope(&mut self, spec: ScopeSpec) -> &mut Self {
        self.scopes.insert(spec.key.clone(), spec);
        self
    }

    pub fn remove_field(&mut self, key: &str) -> Option<FieldSpec> {
        self.fields.remove(key)
    }

    pub fn remove_facet(&mut self, key: &str) -> Option<FacetSpec> {
        self.facets.remove(key)
    }

    pub fn remove_sort(&mut self, key: &str) -> Option<SortSpec> {
        self.sorts.remove(key)
    }

    pub fn remove_relation(&mut self, key: &str) -> Option<RelationSpec> {
        self.relations.remove(key)
    }

    pub fn remove_citation_format(&mut self, key: &str) -> Option<CitationFormatSpec> {
        self.citation_formats.remove(key)
    }

    pub fn remove_scope(&mut self, key: &str) -> Option<ScopeSpec> {
        self.scopes.remove(key)
    }

    /// Registered fields among `keys`, in the order given. Unknown keys are
    /// dropped.
    pub fn select_fields(&self, keys: &[&str]) -> Vec<&FieldSpec> {
        keys.iter().filter_map(|k| self.fields.get(*k)).collect()
    }

    pub fn stem_language(&mut self, language: Option<Language>) -> &mut Self {
        self.stem_language = language;
        self
    }

    pub fn boolean_operators(&mut self, operators: BTreeMap<String, String>) -> &mut Self {
        self.boolean_operators = operators;
        self
    }

    /// Freeze the specs and build the index schema.
    pub fn finish(self) -> Result<Registry> {
        if let Some(key) = self.facets.keys().find(|k| self.fields.contains_key(*k)) {
            return Err(Error::Config(format!(
                "'{key}' is registered both as a field and as a facet"
            )));
        }
        if !self.fields.contains_key(ID_FIELD) {
            return Err(Error::Config(format!("the '{ID_FIELD}' field is required")));
        }
        for sort in self.sorts.values() {
            if let Some(missing) = sort.fields.iter().find(|f| !self.fields.contains_key(*f)) {
                return Err(Error::Config(format!(
                    "sort '{}' uses unknown field '{missing}'",
                    sort.key
                )));
            }
        }
        for relation in self.relations.values() {
            let known = std::iter::once(&relation.field)
                .chain(&relation.id_fields)
                .all(|f| self.fields.contains_key(f));
            if !known {
                return Err(Error::Config(format!(
                    "relation '{}' uses unknown fields",
                    relation.key
                )));
            }
        }

        let mut builder = Schema::builder();
        let mut handles = HashMap::new();
        for spec in self.fields.values() {
            let field = match spec.field_type {
                FieldType::Id | FieldType::Keyword => {
                    builder.add_text_field(&spec.key, STRING | STORED)
                }
                FieldType::Text => builder.add_text_field(&spec.key, analyzed(TEXT_ANALYZER)),
                FieldType::Name => builder.add_text_field(&spec.key, analyzed(NAME_ANALYZER)),
                FieldType::Stored => builder.add_text_field(&spec.key, STORED),
                FieldType::Boolean => builder.add_bool_field(&spec.key, INDEXED | STORED),
                FieldType::Integer => builder.add_u64_field(&spec.key, INDEXED | STORED | FAST),
            };
            handles.insert(spec.key.clone(), field);
        }
        for spec in self.facets.values() {
            let field = builder.add_text_field(&spec.key, STRING | STORED);
            handles.insert(spec.key.clone(), field);
        }

        let mut facets: Vec<FacetSpec> = self.facets.into_values().collect();
        facets.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.key.cmp(&b.key)));
        let mut sorts: Vec<SortSpec> = self.sorts.into_values().collect();
        sorts.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.key.cmp(&b.key)));
        let mut scopes: Vec<ScopeSpec> = self.scopes.into_values().collect();
        scopes.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.key.cmp(&b.key)));

        Ok(Registry {
            schema: builder.build(),
            handles,
            fields: self.fields,
            facets,
            sorts,
            relations: self.relations,
            citation_formats: self.citation_formats,
            scopes,
            stem_language: self.stem_language,
            boolean_operators: self.boolean_operators,
        })
    }
}

fn analyzed(tokenizer: &str) -> TextOptions {
    TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(tokenizer)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    )
}

/// Tantivy stemmer language for an ISO 639-1 code.
pub fn stem_language(code: &str) -> Option<Language> {
    Some(match code.to_ascii_lowercase().as_str() {
        "ar" => Language::Arabic,
        "da" => Language::Danish,
        "de" => Language::German,
        "el" => Language::Greek,
        "en" => Language::English,
        "es" => Language::Spanish,
        "fi" => Language::Finnish,
        "fr" => Language::French,
        "hu" => Language::Hungarian,
        "it" => Language::Italian,
        "nl" => Language::Dutch,
        "no" => Language::Norwegian,
        "pt" => Language::Portuguese,
        "ro" => Language::Romanian,
        "ru" => Language::Russian,
        "sv" => Language::Swedish,
        "ta" => Language::Tamil,
        "tr" => Language::Turkish,
        _ => return None,
    })
}

/// The frozen set of specs and the index schema derived from them.
#[derive(Debug)]
pub struct Registry {
    schema: Schema,
    handles: HashMap<String, Field>,
    fields: BTreeMap<String, FieldSpec>,
    /// Ordered by weight.
    facets: Vec<FacetSpec>,
    /// Ordered by weight.
    sorts: Vec<SortSpec>,
    relations: BTreeMap<String, RelationSpec>,
    citation_formats: BTreeMap<String, CitationFormatSpec>,
    /// Ordered by weight.
    scopes: Vec<ScopeSpec>,
    stem_language: Option<Language>,
    boolean_operators: BTreeMap<String, String>,
}

impl Registry {
    /// The standard bibliographic registry, adjusted by `config`.
    pub fn default_for(config: &Config) -> Result<Self> {
        Composer::default_for(config)?.finish()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Index field handle of a field or facet.
    pub fn handle(&self, key: &str) -> Result<Field> {
        self.handles.get(key).copied().ok_or_else(|| Error::NotFound {
            kind: "field",
            name: key.to_string(),
        })
    }

    pub fn field(&self, key: &str) -> Option<&FieldSpec> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values()
    }

    pub fn select_fields(&self, keys: &[&str]) -> Vec<&FieldSpec> {
        keys.iter().filter_map(|k| self.fields.get(*k)).collect()
    }

    pub fn facets(&self) -> &[FacetSpec] {
        &self.facets
    }

    pub fn facet(&self, key: &str) -> Option<&FacetSpec> {
        self.facets.iter().find(|f| f.key == key)
    }

    pub fn facet_by_filter(&self, filter_key: &str) -> Option<&FacetSpec> {
        self.facets.iter().find(|f| f.filter_key == filter_key)
    }

    pub fn sorts(&self) -> &[SortSpec] {
        &self.sorts
    }

    pub fn sort(&self, key: &str) -> Option<&SortSpec> {
        self.sorts.iter().find(|s| s.key == key)
    }

    /// The first sort allowed for the given keyword state.
    pub fn default_sort(&self, has_keywords: bool) -> Option<&SortSpec> {
        self.sorts.iter().find(|s| s.is_allowed(has_keywords))
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationSpec> {
        self.relations.values()
    }

    pub fn relation(&self, key: &str) -> Option<&RelationSpec> {
        self.relations.get(key)
    }

    pub fn citation_formats(&self) -> impl Iterator<Item = &CitationFormatSpec> {
        self.citation_formats.values()
    }

    pub fn citation_format(&self, key: &str) -> Option<&CitationFormatSpec> {
        self.citation_formats.get(key)
    }

    pub fn scopes(&self) -> &[ScopeSpec] {
        &self.scopes
    }

    /// Searchable fields of a scope.
    pub fn scope_fields(&self, scope: &str) -> Result<Vec<&FieldSpec>> {
        if !self.scopes.iter().any(|s| s.key == scope) {
            return Err(Error::UnknownScope {
                scope: scope.to_string(),
            });
        }
        let fields: Vec<&FieldSpec> = self
            .fields
            .values()
            .filter(|f| f.in_scope(scope) && f.field_type.is_searchable())
            .collect();
        if fields.is_empty() {
            return Err(Error::EmptyScope {
                scope: scope.to_string(),
            });
        }
        Ok(fields)
    }

    pub fn boolean_operators(&self) -> &BTreeMap<String, String> {
        &self.boolean_operators
    }

    /// Remote formats needed by any field or facet, `data` first.
    pub fn required_formats(&self) -> Vec<Format> {
        let mut formats = vec![Format::Data];
        let extractors = self
            .fields
            .values()
            .map(|f| &f.extractor)
            .chain(self.facets.iter().map(|f| &f.extractor));
        for format in extractors.flat_map(|e| e.formats()) {
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        formats
    }

    pub fn needs_fulltext(&self) -> bool {
        self.required_formats().contains(&Format::Fulltext)
    }

    /// Register the analyzers the schema refers to on `index`.
    pub fn register_tokenizers(&self, index: &Index) {
        let text = match self.stem_language {
            Some(language) => TextAnalyzer::builder(SimpleTokenizer::default())
                .filter(RemoveLongFilter::limit(40))
                .filter(LowerCaser)
                .filter(Stemmer::new(language))
                .filter(AsciiFoldingFilter)
                .build(),
            None => name_analyzer(),
        };
        index.tokenizers().register(TEXT_ANALYZER, text);
        index.tokenizers().register(NAME_ANALYZER, name_analyzer());
    }

    /// Build the index document of one item.
    pub fn document(&self, view: &ItemView<'_>, library: &LibraryContext) -> Result<TantivyDocument> {
        let mut document = TantivyDocument::default();
        for spec in self.fields.values() {
            spec.extract_and_store(&mut document, self.handle(&spec.key)?, view, library);
        }
        for spec in &self.facets {
            spec.extract_and_store(&mut document, self.handle(&spec.key)?, view, library);
        }
        Ok(document)
    }

    /// Stored values of one field or facet in a document.
    pub fn stored(&self, document: &TantivyDocument, key: &str) -> Result<Vec<Stored>> {
        let field = self.handle(key)?;
        Ok(document
            .get_all(field)
            .filter_map(|v| {
                if let Some(s) = v.as_str() {
                    Some(Stored::Text(s.to_string()))
                } else if let Some(b) = v.as_bool() {
                    Some(Stored::Bool(b))
                } else {
                    v.as_u64().map(Stored::U64)
                }
            })
            .collect())
    }
}

fn name_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(AsciiFoldingFilter)
        .build()
}

// -- Default registry --

/// Data keys already covered by dedicated fields, or meaningless to search.
const NON_TEXT_DATA: &[&str] = &[
    "key",
    "version",
    "itemType",
    "title",
    "creators",
    "abstractNote",
    "tags",
    "collections",
    "relations",
    "dateAdded",
    "dateModified",
    "accessDate",
    "parentItem",
    "deleted",
    "publicationTitle",
    "bookTitle",
    "proceedingsTitle",
    "publisher",
    "series",
    "url",
    "date",
];

/// Matches links to items, as Zotero writes them into notes.
const ITEM_LINK_RE: &str = r"(?:zotero://select/(?:library|groups/\d+)|/(?:users|groups)/\d+)/items/([A-Z0-9]{8})";

fn boxed(e: impl Extractor + 'static) -> BoxedExtractor {
    Box::new(e)
}

impl Composer {
    /// The standard bibliographic schema, with facets and the full-text
    /// field toggled by `config`.
    pub fn default_for(config: &Config) -> Result<Self> {
        let child_gate = config.child_gate()?;
        let mut c = Self::new();
        c.stem_language(stem_language(&config.search.stem_language))
            .boolean_operators(config.search.boolean_operators.clone());

        for (key, label, weight) in [
            ("all", "Everywhere", 0),
            ("creator", "In authors or contributors", 10),
            ("title", "In titles", 20),
            ("pubyear", "In publication year", 30),
            ("metadata", "In all fields", 40),
            ("fulltext", "In documents", 50),
        ] {
            c.register_scope(ScopeSpec {
                key: key.into(),
                label: label.into(),
                weight,
            });
        }

        c.register_field(FieldSpec::new(ID_FIELD, FieldType::Id, Key))
            .register_field(FieldSpec::new("version", FieldType::Integer, Version))
            .register_field(FieldSpec::new("item_type", FieldType::Keyword, ItemType))
            .register_field(FieldSpec::new(
                "item_type_label",
                FieldType::Stored,
                ItemTypeLabel { labeled: false },
            ))
            .register_field(
                FieldSpec::new("data", FieldType::Stored, Rendered(Format::Data))
                    .codec(FieldCodec::Json),
            )
            .register_field(FieldSpec::new("bib", FieldType::Stored, Rendered(Format::Bib)))
            .register_field(FieldSpec::new(
                "coins",
                FieldType::Stored,
                Rendered(Format::Coins),
            ))
            .register_field(FieldSpec::new(
                "alternate_id",
                FieldType::Keyword,
                Multi(vec![
                    boxed(DataField::new("DOI")),
                    boxed(Transformer {
                        inner: boxed(DataField::new("ISBN")),
                        transforms: vec![Transform::split(" ")],
                    }),
                    boxed(DataField::new("ISSN")),
                    boxed(Transformer {
                        inner: boxed(DataField::new("extra")),
                        transforms: vec![Transform::find(
                            r"(?im)^\s*(?:DOI|ISBN|ISSN):\s*(\S+)\s*$",
                        )?],
                    }),
                ]),
            ))
            .register_field(FieldSpec::new(
                "date",
                FieldType::Stored,
                Chain(vec![
                    boxed(MetaField::new("parsedDate")),
                    boxed(DataField::new("date")),
                ]),
            ))
            .register_field(FieldSpec::new("year", FieldType::Keyword, Year))
            .register_field(FieldSpec::new("url", FieldType::Stored, DataField::new("url")));

        c.register_field(
            FieldSpec::new("text_title", FieldType::Text, DataField::new("title"))
                .scopes(&["all", "title", "metadata"])
                .boost(3.0),
        )
        .register_field(
            FieldSpec::new("text_creators", FieldType::Name, Creators::default())
                .scopes(&["all", "creator", "metadata"])
                .boost(2.0),
        )
        .register_field(
            FieldSpec::new(
                "text_publication",
                FieldType::Text,
                Multi(
                    ["publicationTitle", "bookTitle", "proceedingsTitle", "publisher", "series"]
                        .into_iter()
                        .map(|f| boxed(DataField::new(f)))
                        .collect(),
                ),
            )
            .scopes(&["all", "metadata"]),
        )
        .register_field(
            FieldSpec::new("text_abstract", FieldType::Text, DataField::new("abstractNote"))
                .scopes(&["all", "metadata"]),
        )
        .register_field(
            FieldSpec::new("text_tags", FieldType::Text, Tags::skipping("^_")?)
                .scopes(&["all", "metadata"]),
        )
        .register_field(
            FieldSpec::new("text_collections", FieldType::Text, CollectionNames)
                .scopes(&["all", "metadata"]),
        )
        .register_field(
            FieldSpec::new("text_data", FieldType::Text, AllDataText::skipping(NON_TEXT_DATA))
                .scopes(&["all", "metadata"]),
        )
        .register_field(
            FieldSpec::new("text_year", FieldType::Text, Year)
                .scopes(&["all", "pubyear", "metadata"]),
        )
        .register_field(
            FieldSpec::new(
                "text_notes",
                FieldType::Text,
                Children::notes(child_gate.clone(), ChildOutput::Text),
            )
            .scopes(&["all", "metadata"]),
        );
        if config.sync.fulltext {
            c.register_field(
                FieldSpec::new(
                    "text_fulltext",
                    FieldType::Text,
                    Children::attachments(child_gate.clone(), ChildOutput::Fulltext),
                )
                .scopes(&["all", "fulltext"]),
            );
        }

        c.register_field(
            FieldSpec::new(
                "attachments",
                FieldType::Stored,
                Children::attachments(child_gate.clone(), ChildOutput::Attachments)
                    .with_link_modes(&["imported_file", "imported_url"]),
            )
            .codec(FieldCodec::Json),
        )
        .register_field(
            FieldSpec::new(
                "links",
                FieldType::Stored,
                Children::attachments(child_gate.clone(), ChildOutput::Attachments)
                    .with_link_modes(&["linked_url"]),
            )
            .codec(FieldCodec::Json),
        )
        .register_field(FieldSpec::new("sort_title", FieldType::Keyword, SortTitle).codec(FieldCodec::Text))
        .register_field(
            FieldSpec::new("sort_creators", FieldType::Keyword, CreatorsSortKey)
                .codec(FieldCodec::Text),
        )
        .register_field(FieldSpec::new("sort_date", FieldType::Keyword, SortDate).codec(FieldCodec::Text))
        .register_field(
            FieldSpec::new("sort_date_added", FieldType::Keyword, DataField::new("dateAdded"))
                .codec(FieldCodec::Text),
        )
        .register_field(FieldSpec::new(
            "rel_related",
            FieldType::Keyword,
            Relations {
                predicate: "dc:relation".into(),
            },
        ))
        .register_field(FieldSpec::new(
            "rel_cites",
            FieldType::Keyword,
            Transformer {
                inner: boxed(Children::notes(
                    TagGate::single(Some("_cites$"), None)?,
                    ChildOutput::NoteHtml,
                )),
                transforms: vec![Transform::find(ITEM_LINK_RE)?],
            },
        ));

        for (key, label, mime_type, extension) in [
            ("ris", "RIS", "application/x-research-info-systems", "ris"),
            ("bibtex", "BibTeX", "application/x-bibtex", "bib"),
        ] {
            let field = format!("format_{key}");
            let format = Format::Export(key.to_string());
            c.register_field(FieldSpec::new(&field, FieldType::Stored, Rendered(format.clone())));
            c.register_citation_format(CitationFormatSpec {
                key: key.into(),
                label: label.into(),
                mime_type: mime_type.into(),
                extension: extension.into(),
                format,
                field,
            });
        }

        let search = &config.search;
        if search.tag_facet {
            c.register_facet(
                FacetSpec::new(
                    "facet_tag",
                    FacetKind::Flat,
                    "Topic",
                    "topic",
                    Tags::skipping("^_")?,
                    FacetCodec::Identity,
                )
                .weight(100)
                .missing_label("No topic"),
            );
        }
        if search.item_type_facet {
            c.register_facet(
                FacetSpec::new(
                    "facet_item_type",
                    FacetKind::Flat,
                    "Resource type",
                    "type",
                    ItemTypeLabel { labeled: true },
                    FacetCodec::labeled(),
                )
                .weight(200)
                .allow_overlap(false),
            );
        }
        if search.year_facet {
            c.register_facet(
                FacetSpec::new(
                    "facet_year",
                    FacetKind::Tree {
                        separator: PATH_SEPARATOR,
                    },
                    "Publication year",
                    "year",
                    Year,
                    FacetCodec::YearTree,
                )
                .weight(300)
                .sort(&[FacetSortKey::Label], true)
                .allow_overlap(false),
            );
        }
        if search.link_facet {
            c.register_facet(
                FacetSpec::new(
                    "facet_link",
                    FacetKind::Flat,
                    "Online resource",
                    "link",
                    Exists(boxed(DataField::new("url"))),
                    FacetCodec::boolean(),
                )
                .weight(400)
                .allow_overlap(false)
                .item_view(false),
            );
        }
        if search.attachment_facet {
            c.register_facet(
                FacetSpec::new(
                    "facet_attachment",
                    FacetKind::Flat,
                    "Attached document",
                    "attachment",
                    Children::new(&[ATTACHMENT], child_gate, ChildOutput::Exists)
                        .with_link_modes(&["imported_file", "imported_url"]),
                    FacetCodec::boolean(),
                )
                .weight(500)
                .allow_overlap(false)
                .item_view(false),
            );
        }
        for facet in &search.collection_facets {
            c.register_facet(
                FacetSpec::new(
                    &format!("facet_{}", facet.key),
                    FacetKind::Collection {
                        collection: facet.collection.clone(),
                    },
                    &facet.title,
                    &facet.key,
                    CollectionTree {
                        root: facet.collection.clone(),
                    },
                    FacetCodec::CollectionPath,
                )
                .weight(facet.weight)
                .sort(&[FacetSortKey::Label], false),
            );
        }

        c.register_sort(SortSpec::score("score", "Relevance"))
            .register_sort(
                SortSpec::by_fields(
                    "date_desc",
                    "Newest first",
                    &["sort_date", "sort_creators", "sort_title"],
                    &[true, false, false],
                )
                .weight(10),
            )
            .register_sort(
                SortSpec::by_fields(
                    "date_asc",
                    "Oldest first",
                    &["sort_date", "sort_creators", "sort_title"],
                    &[false],
                )
                .weight(20),
            )
            .register_sort(
                SortSpec::by_fields(
                    "author_asc",
                    "Author A-Z",
                    &["sort_creators", "sort_title", "sort_date"],
                    &[false],
                )
                .weight(30),
            )
            .register_sort(
                SortSpec::by_fields(
                    "author_desc",
                    "Author Z-A",
                    &["sort_creators", "sort_title", "sort_date"],
                    &[true, true, true],
                )
                .weight(40),
            )
            .register_sort(
                SortSpec::by_fields(
                    "title_asc",
                    "Title A-Z",
                    &["sort_title", "sort_creators", "sort_date"],
                    &[false],
                )
                .weight(50),
            )
            .register_sort(
                SortSpec::by_fields(
                    "title_desc",
                    "Title Z-A",
                    &["sort_title", "sort_creators", "sort_date"],
                    &[true],
                )
                .weight(60),
            );

        c.register_relation(RelationSpec {
            key: "cites".into(),
            label: "Cites".into(),
            field: "rel_cites".into(),
            id_fields: vec![ID_FIELD.into(), "alternate_id".into()],
            directed: true,
            reverse: Some(ReverseRelation {
                key: "cited_by".into(),
                label: "Cited by".into(),
            }),
        })
        .register_relation(RelationSpec {
            key: "related".into(),
            label: "Related".into(),
            field: "rel_related".into(),
            id_fields: vec![ID_FIELD.into(), "alternate_id".into()],
            directed: false,
            reverse: None,
        });

        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::extract::tests::cached;

    fn registry() -> Registry {
        Registry::default_for(&Config::default()).unwrap()
    }

    #[test]
    fn default_registry_builds_schema() {
        let r = registry();
        for key in ["id", "text_title", "facet_year", "format_ris", "rel_cites"] {
            assert!(r.schema().get_field(key).is_ok(), "missing {key}");
        }
        assert!(r.field("text_fulltext").is_some());
        assert_eq!(r.facets()[0].key, "facet_tag");
        assert_eq!(r.sorts()[0].key, "score");
    }

    #[test]
    fn required_formats_cover_extractors() {
        let formats = registry().required_formats();
        assert_eq!(formats[0], Format::Data);
        for f in [
            Format::Bib,
            Format::Coins,
            Format::Fulltext,
            Format::Export("ris".into()),
            Format::Export("bibtex".into()),
        ] {
            assert!(formats.contains(&f), "missing {f}");
        }
    }

    #[test]
    fn fulltext_can_be_disabled() {
        let mut config = Config::default();
        config.sync.fulltext = false;
        let r = Registry::default_for(&config).unwrap();
        assert!(r.field("text_fulltext").is_none());
        assert!(!r.needs_fulltext());
        assert!(matches!(
            r.scope_fields("fulltext"),
            Err(Error::EmptyScope { .. })
        ));
    }

    #[test]
    fn scopes_resolve_searchable_fields() {
        let r = registry();
        let keys: Vec<&str> = r
            .scope_fields("creator")
            .unwrap()
            .iter()
            .map(|f| f.key.as_str())
            .collect();
        assert_eq!(keys, vec!["text_creators"]);
        assert!(matches!(
            r.scope_fields("nope"),
            Err(Error::UnknownScope { .. })
        ));
    }

    #[test]
    fn removal_drops_schema_entry() {
        let mut c = Composer::default_for(&Config::default()).unwrap();
        assert!(c.remove_field("text_abstract").is_some());
        assert!(c.remove_facet("facet_link").is_some());
        assert!(c.remove_field("nope").is_none());
        let r = c.finish().unwrap();
        assert!(r.schema().get_field("text_abstract").is_err());
        assert!(r.schema().get_field("facet_link").is_err());
    }

    #[test]
    fn select_fields_drops_unknown_keys() {
        let r = registry();
        let keys: Vec<&str> = r
            .select_fields(&["bib", "nope", "id"])
            .iter()
            .map(|f| f.key.as_str())
            .collect();
        assert_eq!(keys, vec!["bib", "id"]);
    }

    #[test]
    fn field_and_facet_keys_must_not_collide() {
        let mut c = Composer::new();
        c.register_field(FieldSpec::new(ID_FIELD, FieldType::Id, Key));
        c.register_field(FieldSpec::new("x", FieldType::Keyword, ItemType));
        c.register_facet(FacetSpec::new(
            "x",
            FacetKind::Flat,
            "X",
            "x",
            ItemType,
            FacetCodec::Identity,
        ));
        assert!(matches!(c.finish(), Err(Error::Config(_))));
    }

    #[test]
    fn sorts_must_use_known_fields() {
        let mut c = Composer::new();
        c.register_field(FieldSpec::new(ID_FIELD, FieldType::Id, Key));
        c.register_sort(SortSpec::by_fields("s", "S", &["missing"], &[false]));
        assert!(c.finish().is_err());
    }

    #[test]
    fn sort_reverse_flags() {
        let shared = SortSpec::by_fields("s", "S", &["a", "b"], &[true]);
        assert!(shared.is_reversed(0) && shared.is_reversed(1));
        let each = SortSpec::by_fields("s", "S", &["a", "b"], &[true, false]);
        assert!(each.is_reversed(0) && !each.is_reversed(1));
        assert!(!SortSpec::score("score", "R").is_allowed(false));
        assert!(SortSpec::score("score", "R").is_allowed(true));
    }

    #[test]
    fn document_holds_extracted_fields() {
        let r = registry();
        let item = cached(json!({
            "key": "ITEM0001",
            "version": 3,
            "data": {
                "itemType": "journalArticle",
                "title": "Borrow checking",
                "url": "https://example.org/a",
                "extra": "ISBN: 9780000000001",
                "tags": [{"tag": "rust"}],
            },
            "meta": {"parsedDate": "2019-06-01"},
        }));
        let doc = r.document(&ItemView::new(&item, &[]), &LibraryContext::default()).unwrap();
        assert_eq!(r.stored(&doc, "id").unwrap(), vec![Stored::Text("ITEM0001".into())]);
        assert_eq!(r.stored(&doc, "version").unwrap(), vec![Stored::U64(3)]);
        assert_eq!(
            r.stored(&doc, "facet_year").unwrap(),
            vec![
                Stored::Text("2000".into()),
                Stored::Text("2000.2010".into()),
                Stored::Text("2000.2010.2019".into()),
            ]
        );
        assert_eq!(
            r.stored(&doc, "facet_link").unwrap(),
            vec![Stored::Text("true".into())]
        );
        assert_eq!(
            r.stored(&doc, "facet_attachment").unwrap(),
            vec![Stored::Text("false".into())]
        );
        assert_eq!(
            r.stored(&doc, "alternate_id").unwrap(),
            vec![Stored::Text("9780000000001".into())]
        );
        assert!(r.stored(&doc, "bib").unwrap().is_empty());
    }

    #[test]
    fn cites_are_mined_from_tagged_notes() {
        let r = registry();
        let item = cached(json!({"key": "ITEM0001", "data": {"itemType": "book"}}));
        let note = cached(json!({
            "key": "NOTE0001",
            "data": {
                "itemType": "note",
                "parentItem": "ITEM0001",
                "note": "<a href=\"zotero://select/library/items/CITED001\">x</a> \
                         <a href=\"https://www.zotero.org/groups/9/items/CITED002\">y</a>",
                "tags": [{"tag": "_cites"}],
            },
        }));
        let children = [note];
        let doc = r
            .document(&ItemView::new(&item, &children), &LibraryContext::default())
            .unwrap();
        assert_eq!(
            r.stored(&doc, "rel_cites").unwrap(),
            vec![Stored::Text("CITED001".into()), Stored::Text("CITED002".into())]
        );
    }
}
