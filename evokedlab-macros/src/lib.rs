use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, DeriveInput};

mod stage_meta;
use stage_meta::{parse_stage, Param, Port};

/// Derives a `StageMetadata` factory for a pipeline stage and submits it to
/// the crate-wide stage inventory so graphs can be built from JSON by type name.
///
/// Parameter defaults are JSON literals and are checked against the field
/// type and the `min`/`max` bounds at compile time.
#[proc_macro_derive(StageNode, attributes(stage_meta, param, input, output))]
pub fn derive_stage_node(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let spec = match parse_stage(&input) {
        Ok(spec) => spec,
        Err(e) => return e.write_errors().into(),
    };

    let struct_name = &input.ident;
    let type_id = struct_name.to_string();
    let display_name = &spec.meta.name;
    let category = &spec.meta.category;

    let params = spec.params.iter().map(param_schema);
    let inputs = spec.inputs.iter().map(port_metadata);
    let outputs = spec.outputs.iter().map(port_metadata);

    let lower = type_id.to_lowercase();
    let mod_name = format_ident!("__stage_registration_{}", lower);
    let factory_fn = format_ident!("stage_metadata_{}", lower);

    let expanded = quote! {
        #[doc(hidden)]
        mod #mod_name {
            use super::*;

            fn #factory_fn() -> crate::registry::StageMetadata {
                crate::registry::StageMetadata {
                    id: #type_id.to_string(),
                    name: #display_name.to_string(),
                    category: #category.to_string(),
                    inputs: vec![#(#inputs),*],
                    outputs: vec![#(#outputs),*],
                    parameters: vec![#(#params),*],
                    factory: || Box::new(#struct_name::default()),
                }
            }

            ::inventory::submit! {
                crate::registry::StageMetadataFactoryWrapper(#factory_fn)
            }
        }
    };

    TokenStream::from(expanded)
}

fn optional(bound: Option<f64>) -> TokenStream2 {
    match bound {
        Some(v) => quote! { Some(#v) },
        None => quote! { None },
    }
}

fn param_schema(param: &Param) -> TokenStream2 {
    let name = &param.name;
    let kind = param.kind.as_str();
    let default = &param.default;
    let min = optional(param.min);
    let max = optional(param.max);
    quote! {
        crate::registry::ParameterSchema {
            name: #name.to_string(),
            param_type: #kind.to_string(),
            default: serde_json::from_str(#default).unwrap_or(serde_json::Value::Null),
            min: #min,
            max: #max,
        }
    }
}

fn port_metadata(port: &Port) -> TokenStream2 {
    let Port { id, name, data_type } = port;
    quote! {
        crate::registry::PortMetadata {
            id: #id.to_string(),
            name: #name.to_string(),
            data_type: #data_type.to_string(),
        }
    }
}
