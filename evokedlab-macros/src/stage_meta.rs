use darling::{Error, FromAttributes, FromField};
use syn::{Data, DeriveInput, Field, Fields};

/// `#[stage_meta(name = "...", category = "...")]` on the stage struct
#[derive(Debug, FromAttributes)]
#[darling(attributes(stage_meta))]
pub struct StageMetaArgs {
    pub name: String,
    pub category: String,
}

#[derive(Debug, FromField)]
#[darling(attributes(param))]
struct ParamAttr {
    ident: Option<syn::Ident>,
    ty: syn::Type,
    default: String,
    #[darling(default)]
    min: Option<f64>,
    #[darling(default)]
    max: Option<f64>,
}

#[derive(Debug, FromField)]
#[darling(attributes(input, output))]
struct PortAttr {
    ident: Option<syn::Ident>,
    #[darling(default)]
    name: Option<String>,
    #[darling(default)]
    data_type: Option<String>,
}

/// JSON type a parameter is edited as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Number,
    Text,
    Boolean,
}

impl ParamKind {
    fn of(ty: &syn::Type) -> Option<Self> {
        let syn::Type::Path(path) = ty else {
            return None;
        };
        let last = path.path.segments.last()?.ident.to_string();
        match last.as_str() {
            "f64" | "f32" | "u32" | "i32" | "u64" | "i64" | "usize" => Some(Self::Number),
            "String" => Some(Self::Text),
            "bool" => Some(Self::Boolean),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Text => "string",
            Self::Boolean => "boolean",
        }
    }
}

pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    /// JSON literal, checked against `kind`
    pub default: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

pub struct Port {
    pub id: String,
    pub name: String,
    pub data_type: String,
}

/// Everything the derive needs from one stage struct
pub struct StageSpec {
    pub meta: StageMetaArgs,
    pub params: Vec<Param>,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
}

fn has_attr(field: &Field, name: &str) -> bool {
    field.attrs.iter().any(|attr| attr.path().is_ident(name))
}

fn ident_of(ident: &Option<syn::Ident>) -> String {
    ident.as_ref().map(|i| i.to_string()).unwrap_or_default()
}

fn check_default(kind: ParamKind, default: &str, min: Option<f64>, max: Option<f64>) -> Result<(), String> {
    let literal = default.trim();
    match kind {
        ParamKind::Number => {
            let value: f64 = literal
                .parse()
                .map_err(|_| format!("default {} is not a number", literal))?;
            if min.is_some_and(|m| value < m) || max.is_some_and(|m| value > m) {
                return Err(format!("default {} lies outside [min, max]", literal));
            }
        }
        ParamKind::Text => {
            if literal.len() < 2 || !literal.starts_with('"') || !literal.ends_with('"') {
                return Err(format!("default {} must be a quoted JSON string", literal));
            }
        }
        ParamKind::Boolean => {
            if literal != "true" && literal != "false" {
                return Err(format!("default {} is not a boolean", literal));
            }
        }
    }
    Ok(())
}

fn parse_param(field: &Field) -> darling::Result<Param> {
    let attr = ParamAttr::from_field(field)?;
    let kind = ParamKind::of(&attr.ty).ok_or_else(|| {
        Error::custom("#[param] fields must be numeric, String or bool").with_span(&attr.ty)
    })?;
    if let (Some(min), Some(max)) = (attr.min, attr.max) {
        if min > max {
            return Err(Error::custom(format!("min {} exceeds max {}", min, max)).with_span(field));
        }
    }
    check_default(kind, &attr.default, attr.min, attr.max)
        .map_err(|msg| Error::custom(msg).with_span(field))?;
    Ok(Param {
        name: ident_of(&attr.ident),
        kind,
        default: attr.default,
        min: attr.min,
        max: attr.max,
    })
}

fn parse_port(field: &Field) -> darling::Result<Port> {
    let attr = PortAttr::from_field(field)?;
    // `_in` style placeholders are addressed without the underscore
    let id = ident_of(&attr.ident).trim_start_matches('_').to_string();
    Ok(Port {
        name: attr.name.unwrap_or_else(|| id.clone()),
        data_type: attr.data_type.unwrap_or_else(|| "block".to_string()),
        id,
    })
}

/// Walk the struct once, collecting every attribute error before bailing.
pub fn parse_stage(input: &DeriveInput) -> darling::Result<StageSpec> {
    let mut errors = Error::accumulator();
    let meta = errors.handle(StageMetaArgs::from_attributes(&input.attrs));

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => named.named.iter().collect::<Vec<_>>(),
            Fields::Unit => Vec::new(),
            Fields::Unnamed(_) => {
                errors.push(Error::custom("StageNode needs named fields").with_span(&input.ident));
                Vec::new()
            }
        },
        _ => {
            errors.push(Error::custom("StageNode can only be derived for structs").with_span(&input.ident));
            Vec::new()
        }
    };

    let mut params = Vec::new();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for field in fields {
        if has_attr(field, "param") {
            if let Some(param) = errors.handle(parse_param(field)) {
                params.push(param);
            }
        }
        if has_attr(field, "input") {
            inputs.extend(errors.handle(parse_port(field)));
        }
        if has_attr(field, "output") {
            outputs.extend(errors.handle(parse_port(field)));
        }
    }

    errors.finish()?;
    let meta = meta.ok_or_else(|| Error::custom("missing #[stage_meta(...)]"))?;
    Ok(StageSpec {
        meta,
        params,
        inputs,
        outputs,
    })
}
