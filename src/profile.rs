//! Interview profile: a fixed-shape record of what the interview has learned.
//!
//! The shape lives in [`PROFILE_SCHEMA`] and never changes at runtime; only
//! leaf values are filled in. Payloads coming back from the hosted assistant
//! are coerced against the schema at the boundary ([`Profile::from_json`])
//! rather than trusted, so a malformed extraction can at worst leave fields
//! empty.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Type of a leaf field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// Free text.
    Text,
    /// Ordered list of short strings.
    List,
    /// One of a fixed set of snake_case options.
    Choice(&'static [&'static str]),
    /// Number within an inclusive range.
    Scale { min: f64, max: f64 },
}

/// A leaf field in the schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Related fields share a cluster and are asked about together.
    pub cluster: &'static str,
    pub description: &'static str,
}

/// A top-level section of the schema.
#[derive(Debug, Clone, Copy)]
pub struct SectionDef {
    pub name: &'static str,
    pub description: &'static str,
    pub fields: &'static [FieldDef],
}

const fn text(name: &'static str, cluster: &'static str, description: &'static str) -> FieldDef {
    FieldDef {
        name,
        kind: FieldKind::Text,
        cluster,
        description,
    }
}

const fn list(name: &'static str, cluster: &'static str, description: &'static str) -> FieldDef {
    FieldDef {
        name,
        kind: FieldKind::List,
        cluster,
        description,
    }
}

const UNIT_SCALE: FieldKind = FieldKind::Scale { min: 0.0, max: 1.0 };

/// Canonical profile schema, in declaration order.
pub static PROFILE_SCHEMA: &[SectionDef] = &[
    SectionDef {
        name: "core_values_and_priorities",
        description: "What the person values and how they rank competing demands",
        fields: &[
            list("personal_values", "values", "Values that guide their personal life"),
            list("professional_values", "values", "Values that guide their work"),
            list(
                "prioritization_rules",
                "priorities",
                "Rules of thumb they use when priorities conflict",
            ),
        ],
    },
    SectionDef {
        name: "personality_and_emotional_profile",
        description: "Temperament, emotional habits and leadership tendencies",
        fields: &[
            text(
                "emotional_regulation",
                "emotions",
                "How they notice and manage their emotions",
            ),
            text("leadership_style", "leadership", "How they lead or influence others"),
            text(
                "decision_making_tendencies",
                "leadership",
                "Habitual tendencies when making decisions",
            ),
        ],
    },
    SectionDef {
        name: "decision_making_framework",
        description: "How they weigh information, risk and time horizons",
        fields: &[
            FieldDef {
                name: "analytical_intuitive_balance",
                kind: UNIT_SCALE,
                cluster: "decision_style",
                description: "0 = purely analytical, 1 = purely intuitive",
            },
            FieldDef {
                name: "risk_tolerance",
                kind: FieldKind::Choice(&["low", "moderate", "high"]),
                cluster: "risk_and_time",
                description: "Appetite for risk",
            },
            FieldDef {
                name: "timeframe_focus",
                kind: FieldKind::Choice(&["short_term", "long_term", "balanced"]),
                cluster: "risk_and_time",
                description: "Time horizon they optimise for",
            },
        ],
    },
    SectionDef {
        name: "behavioral_patterns",
        description: "Recurring behaviour under pressure and in daily life",
        fields: &[
            text("stress_response", "stress", "What they do when under stress"),
            text("conflict_resolution", "conflict", "How they resolve disagreements"),
            text("work_life_balance", "balance", "How they split time and energy"),
        ],
    },
    SectionDef {
        name: "relationships_and_interactions",
        description: "How they work with and relate to other people",
        fields: &[
            text("collaboration_style", "collaboration", "How they prefer to collaborate"),
            text("trust_building", "collaboration", "How they build and extend trust"),
            text("conflict_handling", "conflict", "How they handle interpersonal conflict"),
        ],
    },
    SectionDef {
        name: "growth_and_learning",
        description: "How they learn, reflect and adapt",
        fields: &[
            text("preferred_learning", "learning", "How they prefer to learn new things"),
            text(
                "reflection_tendencies",
                "learning",
                "How and when they reflect on experience",
            ),
            FieldDef {
                name: "openness_to_change",
                kind: UNIT_SCALE,
                cluster: "change",
                description: "0 = strongly prefers stability, 1 = actively seeks change",
            },
        ],
    },
    SectionDef {
        name: "creativity_and_divergence",
        description: "Where and why they depart from convention",
        fields: &[
            text("divergent_thinking", "creativity", "How they generate unusual ideas"),
            text(
                "contrarian_tendencies",
                "contrarian",
                "When they push back against consensus",
            ),
            text(
                "paradox_handling",
                "ambiguity",
                "How they deal with contradiction and ambiguity",
            ),
            text(
                "deviation_conditions",
                "ambiguity",
                "Conditions under which they break their own rules",
            ),
        ],
    },
];

/// Placeholder answers that mean "nothing learned yet".
const EMPTY_PLACEHOLDERS: &[&str] = &[
    "unknown",
    "n/a",
    "na",
    "none",
    "null",
    "not mentioned",
    "not discussed",
    "not specified",
];

// ---------------------------------------------------------------------------
// Field paths
// ---------------------------------------------------------------------------

/// Dotted `section.field` path to a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    pub section: String,
    pub field: String,
}

impl FieldPath {
    pub fn new(section: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            field: field.into(),
        }
    }

    /// Look up the schema entry for this path.
    pub fn definition(&self) -> Option<&'static FieldDef> {
        PROFILE_SCHEMA
            .iter()
            .find(|s| s.name == self.section)?
            .fields
            .iter()
            .find(|f| f.name == self.field)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section, self.field)
    }
}

impl std::str::FromStr for FieldPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (section, field) = s
            .split_once('.')
            .ok_or_else(|| format!("field path '{s}' must look like section.field"))?;
        let path = Self::new(section, field);
        if path.definition().is_none() {
            return Err(format!("unknown field path '{s}'"));
        }
        Ok(path)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Every leaf path in schema declaration order.
pub fn leaf_paths() -> impl Iterator<Item = FieldPath> {
    PROFILE_SCHEMA.iter().flat_map(|section| {
        section
            .fields
            .iter()
            .map(move |field| FieldPath::new(section.name, field.name))
    })
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Value of a leaf field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(Option<String>),
    List(Vec<String>),
    Choice(Option<String>),
    Scale(Option<f64>),
}

impl FieldValue {
    /// The zero value for a field kind.
    pub fn empty(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Text => Self::Text(None),
            FieldKind::List => Self::List(Vec::new()),
            FieldKind::Choice(_) => Self::Choice(None),
            FieldKind::Scale { .. } => Self::Scale(None),
        }
    }

    /// Whether this value counts as "missing".
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(v) | Self::Choice(v) => v.as_deref().is_none_or(str::is_empty),
            Self::List(items) => items.is_empty(),
            Self::Scale(v) => v.is_none(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Text(v) | Self::Choice(v) => v.as_ref().map_or(Value::Null, |s| json!(s)),
            Self::List(items) => json!(items),
            Self::Scale(v) => v.map_or(Value::Null, |n| json!(n)),
        }
    }

    /// Merge an incoming value into this one. Returns whether anything changed.
    ///
    /// Scalars are overwritten by present incoming values; lists gain the
    /// incoming items they do not already hold. An empty incoming value is a
    /// no-op, so a merge never clears a field.
    fn merge_from(&mut self, incoming: &FieldValue) -> bool {
        if incoming.is_empty() {
            return false;
        }
        match (self, incoming) {
            (Self::List(current), Self::List(new_items)) => {
                let mut changed = false;
                for item in new_items {
                    if !contains_ignore_case(current, item) {
                        current.push(item.clone());
                        changed = true;
                    }
                }
                changed
            }
            (current, incoming) => {
                if current == incoming {
                    false
                } else {
                    *current = incoming.clone();
                    true
                }
            }
        }
    }
}

fn contains_ignore_case(items: &[String], candidate: &str) -> bool {
    items.iter().any(|i| i.eq_ignore_ascii_case(candidate))
}

/// A coercion applied while reading an untrusted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIssue {
    pub path: String,
    pub reason: String,
}

impl SchemaIssue {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// The interview profile. Values are stored parallel to [`PROFILE_SCHEMA`].
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    values: Vec<Vec<FieldValue>>,
}

impl Default for Profile {
    fn default() -> Self {
        Self::empty()
    }
}

impl Profile {
    /// A profile with every leaf empty.
    pub fn empty() -> Self {
        Self {
            values: PROFILE_SCHEMA
                .iter()
                .map(|s| s.fields.iter().map(|f| FieldValue::empty(f.kind)).collect())
                .collect(),
        }
    }

    fn index_of(section: &str, field: &str) -> Option<(usize, usize)> {
        let si = PROFILE_SCHEMA.iter().position(|s| s.name == section)?;
        let fi = PROFILE_SCHEMA[si]
            .fields
            .iter()
            .position(|f| f.name == field)?;
        Some((si, fi))
    }

    /// Read a leaf value.
    pub fn get(&self, section: &str, field: &str) -> Option<&FieldValue> {
        let (si, fi) = Self::index_of(section, field)?;
        Some(&self.values[si][fi])
    }

    /// Replace a leaf value, coercing it through the schema.
    pub fn set(&mut self, section: &str, field: &str, raw: &Value) -> Result<(), SchemaIssue> {
        let path = format!("{section}.{field}");
        let (si, fi) =
            Self::index_of(section, field).ok_or_else(|| SchemaIssue::new(&path, "unknown field"))?;
        let mut issues = Vec::new();
        let value = coerce_field(&PROFILE_SCHEMA[si].fields[fi], raw, &path, &mut issues);
        if let Some(issue) = issues.into_iter().next() {
            return Err(issue);
        }
        self.values[si][fi] = value;
        Ok(())
    }

    /// Build a profile from an untrusted JSON payload.
    ///
    /// Missing sections and fields become empty, unknown keys are dropped and
    /// mistyped values are coerced or cleared. Every coercion is reported.
    pub fn from_json(payload: &Value) -> (Self, Vec<SchemaIssue>) {
        let mut profile = Self::empty();
        let mut issues = Vec::new();

        let Some(root) = payload.as_object() else {
            issues.push(SchemaIssue::new("$", "payload is not a JSON object"));
            return (profile, issues);
        };

        for key in root.keys() {
            if !PROFILE_SCHEMA.iter().any(|s| s.name == key) {
                issues.push(SchemaIssue::new(key.as_str(), "unknown section ignored"));
            }
        }

        for (si, section) in PROFILE_SCHEMA.iter().enumerate() {
            let section_value = match root.get(section.name) {
                None | Some(Value::Null) => continue,
                Some(Value::Object(map)) => map,
                Some(_) => {
                    issues.push(SchemaIssue::new(section.name, "section is not an object"));
                    continue;
                }
            };

            for key in section_value.keys() {
                if !section.fields.iter().any(|f| f.name == key) {
                    issues.push(SchemaIssue::new(
                        format!("{}.{}", section.name, key),
                        "unknown field ignored",
                    ));
                }
            }

            for (fi, field) in section.fields.iter().enumerate() {
                if let Some(raw) = section_value.get(field.name) {
                    let path = format!("{}.{}", section.name, field.name);
                    profile.values[si][fi] = coerce_field(field, raw, &path, &mut issues);
                }
            }
        }

        (profile, issues)
    }

    /// Nested JSON with every section and field present.
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for (si, section) in PROFILE_SCHEMA.iter().enumerate() {
            let mut fields = Map::new();
            for (fi, field) in section.fields.iter().enumerate() {
                fields.insert(field.name.to_string(), self.values[si][fi].to_json());
            }
            root.insert(section.name.to_string(), Value::Object(fields));
        }
        Value::Object(root)
    }

    /// Merge newly extracted values into this profile.
    ///
    /// Returns the paths whose value changed.
    pub fn merge(&mut self, incoming: &Profile) -> Vec<FieldPath> {
        let mut changed = Vec::new();
        for (si, section) in PROFILE_SCHEMA.iter().enumerate() {
            for (fi, field) in section.fields.iter().enumerate() {
                if self.values[si][fi].merge_from(&incoming.values[si][fi]) {
                    changed.push(FieldPath::new(section.name, field.name));
                }
            }
        }
        changed
    }

    /// Leaf paths that are still empty, in schema order.
    pub fn missing_fields(&self) -> Vec<FieldPath> {
        let mut missing = Vec::new();
        for (si, section) in PROFILE_SCHEMA.iter().enumerate() {
            for (fi, field) in section.fields.iter().enumerate() {
                if self.values[si][fi].is_empty() {
                    missing.push(FieldPath::new(section.name, field.name));
                }
            }
        }
        missing
    }

    /// Whether any leaf has been filled.
    pub fn is_populated(&self) -> bool {
        self.values.iter().flatten().any(|v| !v.is_empty())
    }
}

impl Serialize for Profile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Profile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let (profile, issues) = Profile::from_json(&raw);
        if !issues.is_empty() {
            tracing::debug!(count = issues.len(), "Coerced stored profile on load");
        }
        Ok(profile)
    }
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

fn coerce_field(
    def: &FieldDef,
    raw: &Value,
    path: &str,
    issues: &mut Vec<SchemaIssue>,
) -> FieldValue {
    match def.kind {
        FieldKind::Text => FieldValue::Text(coerce_text(raw, path, issues)),
        FieldKind::List => FieldValue::List(coerce_list(raw, path, issues)),
        FieldKind::Choice(options) => FieldValue::Choice(coerce_choice(raw, options, path, issues)),
        FieldKind::Scale { min, max } => FieldValue::Scale(coerce_scale(raw, min, max, path, issues)),
    }
}

fn clean_text(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty()
        || EMPTY_PLACEHOLDERS
            .iter()
            .any(|p| trimmed.eq_ignore_ascii_case(p))
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn coerce_text(raw: &Value, path: &str, issues: &mut Vec<SchemaIssue>) -> Option<String> {
    match raw {
        Value::Null => None,
        Value::String(s) => clean_text(s),
        Value::Number(n) => {
            issues.push(SchemaIssue::new(path, "number converted to text"));
            Some(n.to_string())
        }
        Value::Bool(b) => {
            issues.push(SchemaIssue::new(path, "boolean converted to text"));
            Some(b.to_string())
        }
        Value::Array(items) => {
            issues.push(SchemaIssue::new(path, "list joined into text"));
            let parts: Vec<String> = items.iter().filter_map(scalar_to_string).collect();
            clean_text(&parts.join("; "))
        }
        Value::Object(_) => {
            issues.push(SchemaIssue::new(path, "object is not valid text, cleared"));
            None
        }
    }
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => clean_text(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_list(raw: &Value, path: &str, issues: &mut Vec<SchemaIssue>) -> Vec<String> {
    match raw {
        Value::Null => Vec::new(),
        Value::String(s) => {
            issues.push(SchemaIssue::new(path, "single string wrapped into a list"));
            clean_text(s).into_iter().collect()
        }
        Value::Array(items) => {
            let mut out: Vec<String> = Vec::with_capacity(items.len());
            for item in items {
                if !item.is_string() {
                    issues.push(SchemaIssue::new(path, "non-string list item converted"));
                }
                if let Some(s) = scalar_to_string(item) {
                    if !contains_ignore_case(&out, &s) {
                        out.push(s);
                    }
                }
            }
            out
        }
        _ => {
            issues.push(SchemaIssue::new(path, "expected a list of strings, cleared"));
            Vec::new()
        }
    }
}

fn normalize_choice(s: &str) -> String {
    s.trim().to_lowercase().replace(['-', ' '], "_")
}

fn coerce_choice(
    raw: &Value,
    options: &[&str],
    path: &str,
    issues: &mut Vec<SchemaIssue>,
) -> Option<String> {
    match raw {
        Value::Null => None,
        Value::String(s) => {
            clean_text(s)?;
            let normalized = normalize_choice(s);
            if let Some(option) = options.iter().find(|o| **o == normalized) {
                Some((*option).to_string())
            } else {
                issues.push(SchemaIssue::new(
                    path,
                    format!("'{s}' is not one of {}, cleared", options.join("|")),
                ));
                None
            }
        }
        _ => {
            issues.push(SchemaIssue::new(path, "expected one of the allowed options, cleared"));
            None
        }
    }
}

fn coerce_scale(
    raw: &Value,
    min: f64,
    max: f64,
    path: &str,
    issues: &mut Vec<SchemaIssue>,
) -> Option<f64> {
    let n = match raw {
        Value::Null => return None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            clean_text(s)?;
            let parsed = s.trim().parse::<f64>().ok();
            if parsed.is_some() {
                issues.push(SchemaIssue::new(path, "numeric string parsed"));
            }
            parsed
        }
        _ => None,
    };

    let Some(n) = n.filter(|n| n.is_finite()) else {
        issues.push(SchemaIssue::new(path, "expected a number, cleared"));
        return None;
    };

    if n < min || n > max {
        issues.push(SchemaIssue::new(
            path,
            format!("{n} clamped into [{min}, {max}]"),
        ));
    }
    Some(n.clamp(min, max))
}

// ---------------------------------------------------------------------------
// Function schema
// ---------------------------------------------------------------------------

fn field_schema(field: &FieldDef) -> Value {
    match field.kind {
        FieldKind::Text => json!({
            "type": ["string", "null"],
            "description": field.description,
        }),
        FieldKind::List => json!({
            "type": "array",
            "items": { "type": "string" },
            "description": field.description,
        }),
        FieldKind::Choice(options) => {
            let mut allowed: Vec<Value> = options.iter().map(|o| json!(o)).collect();
            allowed.push(Value::Null);
            json!({
                "type": ["string", "null"],
                "enum": allowed,
                "description": field.description,
            })
        }
        FieldKind::Scale { min, max } => json!({
            "type": ["number", "null"],
            "minimum": min,
            "maximum": max,
            "description": field.description,
        }),
    }
}

/// JSON Schema for function-call parameters mirroring the profile shape.
pub fn function_parameters() -> Value {
    let mut sections = Map::new();
    for section in PROFILE_SCHEMA {
        let mut properties = Map::new();
        for field in section.fields {
            properties.insert(field.name.to_string(), field_schema(field));
        }
        sections.insert(
            section.name.to_string(),
            json!({
                "type": "object",
                "description": section.description,
                "properties": properties,
                "additionalProperties": false,
            }),
        );
    }
    json!({
        "type": "object",
        "properties": sections,
        "additionalProperties": false,
    })
}
