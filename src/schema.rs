//! Tool descriptor generation.
//!
//! A tool describes its callable through a [`ToolSignature`]: the declared name,
//! the documentation block and the ordered parameter list with type
//! annotations and defaults. [`generate`] turns that signature into the
//! [`ToolDescriptor`] handed to the model backend. Generation is a pure
//! function of the signature.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{AgentError, Result};

/// How a parameter is supplied at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Supplied by the model.
    Regular,
    /// Injected by middleware (for example a session id); never shown to the model.
    Context,
    VariadicPositional,
    VariadicKeyword,
}

/// Closed set of parameter type categories the generator understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Null,
    Optional(Box<ParamType>),
    /// A fixed set of literal values.
    Literal(Vec<Value>),
    Union(Vec<ParamType>),
    Array(Box<ParamType>),
    Set(Box<ParamType>),
    Tuple(Vec<ParamType>),
    /// String-keyed map with homogeneous values.
    Map(Box<ParamType>),
    Object(Vec<ObjectField>),
    Any,
    /// A type parameter; only representable through its bound.
    TypeParam {
        name: String,
        bound: Option<Box<ParamType>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
}

impl ObjectField {
    pub fn new(name: impl Into<String>, ty: ParamType, required: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            required,
        }
    }
}

impl ParamType {
    pub fn of<T: TypeHint + ?Sized>() -> Self {
        T::param_type()
    }

    pub fn optional(inner: ParamType) -> Self {
        ParamType::Optional(Box::new(inner))
    }

    pub fn array(item: ParamType) -> Self {
        ParamType::Array(Box::new(item))
    }

    pub fn set(item: ParamType) -> Self {
        ParamType::Set(Box::new(item))
    }

    pub fn map(value: ParamType) -> Self {
        ParamType::Map(Box::new(value))
    }

    pub fn literal<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        ParamType::Literal(values.into_iter().map(Into::into).collect())
    }

    pub fn type_param(name: impl Into<String>, bound: Option<ParamType>) -> Self {
        ParamType::TypeParam {
            name: name.into(),
            bound: bound.map(Box::new),
        }
    }
}

/// Maps Rust types onto [`ParamType`].
pub trait TypeHint {
    fn param_type() -> ParamType;
}

macro_rules! hint {
    ($variant:ident => $($ty:ty),+) => {
        $(impl TypeHint for $ty {
            fn param_type() -> ParamType {
                ParamType::$variant
            }
        })+
    };
}

hint!(String => String, str, char);
hint!(Integer => i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
hint!(Number => f32, f64);
hint!(Boolean => bool);
hint!(Any => Value);

impl<T: TypeHint + ?Sized> TypeHint for &T {
    fn param_type() -> ParamType {
        T::param_type()
    }
}

impl<T: TypeHint> TypeHint for Option<T> {
    fn param_type() -> ParamType {
        ParamType::optional(T::param_type())
    }
}

impl<T: TypeHint> TypeHint for Vec<T> {
    fn param_type() -> ParamType {
        ParamType::array(T::param_type())
    }
}

impl<T: TypeHint> TypeHint for [T] {
    fn param_type() -> ParamType {
        ParamType::array(T::param_type())
    }
}

impl<T: TypeHint, S> TypeHint for HashSet<T, S> {
    fn param_type() -> ParamType {
        ParamType::set(T::param_type())
    }
}

impl<T: TypeHint> TypeHint for BTreeSet<T> {
    fn param_type() -> ParamType {
        ParamType::set(T::param_type())
    }
}

impl<V: TypeHint, S> TypeHint for HashMap<String, V, S> {
    fn param_type() -> ParamType {
        ParamType::map(V::param_type())
    }
}

impl<V: TypeHint> TypeHint for BTreeMap<String, V> {
    fn param_type() -> ParamType {
        ParamType::map(V::param_type())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    /// `None` when the parameter carries no annotation.
    pub ty: Option<ParamType>,
    pub default: Option<Value>,
    pub kind: ParamKind,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
            default: None,
            kind: ParamKind::Regular,
        }
    }

    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
            default: None,
            kind: ParamKind::Regular,
        }
    }

    pub fn context(name: impl Into<String>) -> Self {
        Self {
            kind: ParamKind::Context,
            ..Self::new(name, ParamType::String)
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_kind(mut self, kind: ParamKind) -> Self {
        self.kind = kind;
        self
    }
}

/// The declared shape of a callable: name, documentation and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSignature {
    pub name: String,
    pub doc: String,
    pub params: Vec<ParamSpec>,
}

impl ToolSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: String::new(),
            params: Vec::new(),
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn param(self, name: impl Into<String>, ty: ParamType) -> Self {
        self.push(ParamSpec::new(name, ty))
    }

    pub fn param_of<T: TypeHint + ?Sized>(self, name: impl Into<String>) -> Self {
        self.push(ParamSpec::new(name, T::param_type()))
    }

    pub fn param_with_default(
        self,
        name: impl Into<String>,
        ty: ParamType,
        default: impl Into<Value>,
    ) -> Self {
        self.push(ParamSpec::new(name, ty).with_default(default))
    }

    pub fn context(self, name: impl Into<String>) -> Self {
        self.push(ParamSpec::context(name))
    }

    pub fn push(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Names of parameters the model never supplies.
    pub fn context_params(&self) -> impl Iterator<Item = &str> + '_ {
        self.params
            .iter()
            .filter(|p| p.kind == ParamKind::Context)
            .map(|p| p.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertySchema {
    pub name: String,
    pub schema: Value,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertySchema {
    /// The property schema with description and default folded in.
    pub fn to_json(&self) -> Value {
        let mut schema = self.schema.clone();
        if let Value::Object(map) = &mut schema {
            if let Some(description) = &self.description {
                map.insert("description".into(), Value::String(description.clone()));
            }
            if let Some(default) = &self.default {
                map.insert("default".into(), default.clone());
            }
        }
        schema
    }
}

/// Model-facing description of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<PropertySchema>,
}

impl ToolDescriptor {
    pub fn property(&self, name: &str) -> Option<&PropertySchema> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn parameters_json(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.to_json()))
            .collect();
        let mut schema = json!({"type": "object", "properties": properties});
        let required = self.required();
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        schema
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters_json(),
        })
    }
}

fn param_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r":param\s+(\w+)\s*:\s*(.+)").expect("valid param pattern"))
}

/// Split a documentation block into the summary line and per-parameter notes.
pub fn parse_doc(doc: &str) -> (Option<String>, HashMap<String, String>) {
    let summary = doc
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with(':'))
        .map(str::to_string);
    let params = param_pattern()
        .captures_iter(doc)
        .map(|caps| (caps[1].to_string(), caps[2].trim().to_string()))
        .collect();
    (summary, params)
}

/// Build the descriptor for a signature.
pub fn generate(signature: &ToolSignature) -> Result<ToolDescriptor> {
    let unsupported = |parameter: &str, reason: String| AgentError::UnsupportedSignature {
        tool: signature.name.clone(),
        parameter: parameter.to_string(),
        reason,
    };

    if signature.name.trim().is_empty() {
        return Err(unsupported("", "tool name is empty".into()));
    }

    let (summary, notes) = parse_doc(&signature.doc);
    let mut seen = HashSet::new();
    let mut parameters = Vec::new();

    for spec in &signature.params {
        if !seen.insert(spec.name.as_str()) {
            return Err(unsupported(&spec.name, "duplicate parameter name".into()));
        }
        if spec.kind != ParamKind::Regular {
            continue;
        }

        let (schema, optional) = match &spec.ty {
            None => (json!({}), false),
            Some(ty) => resolve_top(ty).map_err(|reason| unsupported(&spec.name, reason))?,
        };

        parameters.push(PropertySchema {
            name: spec.name.clone(),
            schema,
            required: spec.default.is_none() && !optional,
            default: spec.default.clone(),
            description: notes.get(&spec.name).cloned(),
        });
    }

    Ok(ToolDescriptor {
        name: signature.name.clone(),
        description: summary.unwrap_or_else(|| format!("Tool function {}", signature.name)),
        parameters,
    })
}

/// Resolve a parameter's own annotation. Optional wrappers are unwrapped here
/// and reported back so the parameter can be marked not-required.
fn resolve_top(ty: &ParamType) -> std::result::Result<(Value, bool), String> {
    match ty {
        ParamType::Optional(inner) => Ok((resolve(inner)?, true)),
        ParamType::Union(branches) => match nullable_branch(branches) {
            Some(inner) => Ok((resolve(inner)?, true)),
            None => Ok((resolve(ty)?, false)),
        },
        other => Ok((resolve(other)?, false)),
    }
}

/// The single non-null branch of a `T | null` union.
fn nullable_branch(branches: &[ParamType]) -> Option<&ParamType> {
    let mut non_null = branches.iter().filter(|b| **b != ParamType::Null);
    let first = non_null.next()?;
    (non_null.next().is_none() && branches.len() > 1).then_some(first)
}

fn resolve(ty: &ParamType) -> std::result::Result<Value, String> {
    let schema = match ty {
        ParamType::String => json!({"type": "string"}),
        ParamType::Integer => json!({"type": "integer"}),
        ParamType::Number => json!({"type": "number"}),
        ParamType::Boolean => json!({"type": "boolean"}),
        ParamType::Null => json!({"type": "null"}),
        ParamType::Any => json!({}),
        ParamType::Optional(inner) => json!({"anyOf": [resolve(inner)?, {"type": "null"}]}),
        ParamType::Literal(values) => literal_schema(values)?,
        ParamType::Union(branches) => {
            if branches.is_empty() {
                return Err("union without branches".into());
            }
            if branches.len() == 1 {
                return resolve(&branches[0]);
            }
            let any_of = branches
                .iter()
                .map(resolve)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            json!({ "anyOf": any_of })
        }
        ParamType::Array(item) => json!({"type": "array", "items": resolve(item)?}),
        ParamType::Set(item) => {
            json!({"type": "array", "items": resolve(item)?, "uniqueItems": true})
        }
        ParamType::Tuple(items) => {
            if items.is_empty() {
                return Err("tuple without element types".into());
            }
            let prefix = items
                .iter()
                .map(resolve)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            json!({
                "type": "array",
                "prefixItems": prefix,
                "minItems": items.len(),
                "maxItems": items.len(),
            })
        }
        ParamType::Map(value) => {
            json!({"type": "object", "additionalProperties": resolve(value)?})
        }
        ParamType::Object(fields) => object_schema(fields)?,
        ParamType::TypeParam { name, bound } => match bound {
            Some(bound) => resolve(bound)?,
            None => return Err(format!("type parameter `{name}` has no resolvable bound")),
        },
    };
    Ok(schema)
}

fn literal_schema(values: &[Value]) -> std::result::Result<Value, String> {
    if values.is_empty() {
        return Err("literal without values".into());
    }
    if values.iter().any(|v| v.is_array() || v.is_object()) {
        return Err("literal values must be scalars".into());
    }
    let json_type = if values.iter().all(Value::is_string) {
        Some("string")
    } else if values.iter().all(Value::is_boolean) {
        Some("boolean")
    } else if values.iter().all(|v| v.is_i64() || v.is_u64()) {
        Some("integer")
    } else if values.iter().all(Value::is_number) {
        Some("number")
    } else {
        None
    };
    let mut schema = json!({ "enum": values });
    if let Some(json_type) = json_type {
        schema["type"] = json!(json_type);
    }
    Ok(schema)
}

fn object_schema(fields: &[ObjectField]) -> std::result::Result<Value, String> {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in fields {
        if properties.contains_key(&field.name) {
            return Err(format!("duplicate object field `{}`", field.name));
        }
        properties.insert(field.name.clone(), resolve(&field.ty)?);
        if field.required {
            required.push(field.name.clone());
        }
    }
    let mut schema = json!({"type": "object", "properties": properties});
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    Ok(schema)
}
