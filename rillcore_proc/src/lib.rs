//! `#[derive(Replicated)]`: expands a struct into a registered
//! `TypeDescriptor` with one state bit per `#[replicated]`-marked field,
//! plus the `ReplicatedObject`/`GhostHooks` impls a ghost manager needs -
//! removes the hand-written field-list boilerplate a type would otherwise
//! repeat for itself.
//!
//! Field attributes:
//! - `#[replicated]` - include this field, state bit assigned in
//!   declaration order among marked fields.
//! - `#[replicated(initial)]` - only ever sent on a ghost's first update.
//! - `#[replicated(bits = N)]` - width for an integer field (default 32).
//!   Ignored on `bool` fields, which always cost one bit.
//!
//! Exactly one field must be named `dirty_mask` and be of type `u32`, and
//! exactly one field must carry `#[replicated(id)]` and be of type
//! `ObjectId` - these back `ReplicatedObject::dirty_mask`/`object_id`. The
//! struct must also derive `Default`, which backs the ghost factory used
//! to materialize a fresh mirror on the receiving side.

extern crate proc_macro;

use proc_macro2::Span;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, Lit, Meta, NestedMeta};

#[proc_macro_derive(Replicated, attributes(replicated))]
pub fn derive_replicated(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let ast: DeriveInput = syn::parse(input).expect("Replicated only applies to structs");
    expand(ast).into()
}

struct FieldPlan {
    ident: Ident,
    state_bit: u8,
    initial: bool,
    is_bool: bool,
    bits: u32,
}

fn expand(ast: DeriveInput) -> proc_macro2::TokenStream {
    let struct_ident = ast.ident;
    let fields = match ast.data {
        Data::Struct(data) => match data.fields {
            Fields::Named(named) => named.named,
            _ => panic!("Replicated requires named fields"),
        },
        _ => panic!("Replicated only applies to structs"),
    };

    let mut id_field: Option<Ident> = None;
    let mut has_dirty_mask = false;
    let mut plans = Vec::new();
    let mut next_bit: u8 = 0;

    for field in fields.iter() {
        let ident = field.ident.clone().expect("named field");
        if ident == "dirty_mask" {
            has_dirty_mask = true;
            continue;
        }

        let meta = match find_replicated_meta(&field.attrs) {
            Some(meta) => meta,
            None => continue,
        };

        let (marks_id, initial, bits) = parse_replicated_args(&meta);
        if marks_id {
            if id_field.is_some() {
                panic!("Replicated: only one field may carry #[replicated(id)]");
            }
            id_field = Some(ident);
            continue;
        }

        let is_bool = is_bool_type(&field.ty);
        plans.push(FieldPlan {
            ident,
            state_bit: next_bit,
            initial,
            is_bool,
            bits: bits.unwrap_or(32),
        });
        next_bit += 1;
    }

    if !has_dirty_mask {
        panic!("Replicated requires a `dirty_mask: u32` field");
    }
    let id_field = id_field.expect("Replicated requires exactly one #[replicated(id)] field");

    let mut field_fns = Vec::new();
    let mut descriptors = Vec::new();

    for plan in &plans {
        let field_ident = &plan.ident;
        let write_fn = format_ident(&struct_ident, field_ident, "write");
        let read_fn = format_ident(&struct_ident, field_ident, "read");
        let compare_fn = format_ident(&struct_ident, field_ident, "compare");
        let state_bit = plan.state_bit;
        let initial = plan.initial;
        let name_lit = field_ident.to_string();

        let (write_body, read_body) = if plan.is_bool {
            (
                quote! { s.write_bool(obj.downcast_ref::<#struct_ident>().unwrap().#field_ident) },
                quote! {
                    obj.downcast_mut::<#struct_ident>().unwrap().#field_ident = s.read_bool()?;
                    Ok(())
                },
            )
        } else {
            let bits = plan.bits;
            (
                quote! { s.write_signed(obj.downcast_ref::<#struct_ident>().unwrap().#field_ident, #bits) },
                quote! {
                    obj.downcast_mut::<#struct_ident>().unwrap().#field_ident = s.read_signed(#bits)?;
                    Ok(())
                },
            )
        };

        field_fns.push(quote! {
            fn #write_fn(obj: &dyn ::std::any::Any, s: &mut ::rillcore::bitstream::BitWriter) -> ::rillcore::error::NetResult<()> {
                #write_body
            }
            fn #read_fn(obj: &mut dyn ::std::any::Any, s: &mut ::rillcore::bitstream::BitReader) -> ::rillcore::error::NetResult<()> {
                #read_body
            }
            fn #compare_fn(a: &dyn ::std::any::Any, b: &dyn ::std::any::Any) -> bool {
                a.downcast_ref::<#struct_ident>().unwrap().#field_ident == b.downcast_ref::<#struct_ident>().unwrap().#field_ident
            }
        });

        descriptors.push(quote! {
            ::rillcore::reflect::FieldDescriptor {
                name: #name_lit,
                state_bit: #state_bit,
                initial: #initial,
                write: #write_fn,
                read: #read_fn,
                compare: #compare_fn,
            }
        });
    }

    let handle_static = Ident::new(&format!("__{}_TYPE_HANDLE", struct_ident.to_string().to_uppercase()), Span::call_site());
    let ghost_factory_fn = Ident::new(&format!("__{}_ghost_factory", to_snake_case(&struct_ident.to_string())), Span::call_site());

    quote! {
        #[allow(non_upper_case_globals, non_snake_case)]
        const _: () = {
            #(#field_fns)*

            fn #ghost_factory_fn() -> ::std::boxed::Box<dyn ::rillcore::object::GhostHooks> {
                ::std::boxed::Box::new(#struct_ident::default())
            }

            ::rillcore::lazy_static! {
                static ref #handle_static: ::rillcore::reflect::TypeHandle = ::rillcore::reflect::register_type(
                    ::rillcore::reflect::TypeDescriptor::new(
                        ::std::concat!(::std::module_path!(), "::", ::std::stringify!(#struct_ident)),
                        None,
                        ::std::vec![ #(#descriptors),* ],
                    )
                    .with_ghost_factory(#ghost_factory_fn),
                )
                .expect("duplicate Replicated type registration");
            }

            impl ::rillcore::object::ReplicatedObject for #struct_ident {
                fn type_handle(&self) -> ::rillcore::reflect::TypeHandle {
                    *#handle_static
                }
                fn object_id(&self) -> ::rillcore::object::ObjectId {
                    self.#id_field
                }
                fn dirty_mask(&self) -> u32 {
                    self.dirty_mask
                }
                fn mark_clean(&mut self, bits: u32) {
                    self.dirty_mask &= !bits;
                }
                fn mark_dirty(&mut self, bits: u32) {
                    self.dirty_mask |= bits;
                }
                fn as_any(&self) -> &dyn ::std::any::Any {
                    self
                }
                fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                    self
                }
            }

            impl ::rillcore::object::GhostHooks for #struct_ident {}
        };
    }
}

fn find_replicated_meta(attrs: &[syn::Attribute]) -> Option<Meta> {
    attrs.iter().find(|attr| attr.path.is_ident("replicated")).map(|attr| attr.parse_meta().expect("malformed #[replicated(...)] attribute"))
}

/// Returns `(marks_id, initial, bits)` for a `#[replicated]`/`#[replicated(...)]` attribute.
fn parse_replicated_args(meta: &Meta) -> (bool, bool, Option<u32>) {
    let list = match meta {
        Meta::Path(_) => return (false, false, None),
        Meta::List(list) => list,
        Meta::NameValue(_) => panic!("#[replicated] does not take a bare value"),
    };

    let mut marks_id = false;
    let mut initial = false;
    let mut bits = None;

    for nested in &list.nested {
        match nested {
            NestedMeta::Meta(Meta::Path(path)) if path.is_ident("id") => marks_id = true,
            NestedMeta::Meta(Meta::Path(path)) if path.is_ident("initial") => initial = true,
            NestedMeta::Meta(Meta::NameValue(nv)) if nv.path.is_ident("bits") => {
                bits = match &nv.lit {
                    Lit::Int(value) => Some(value.base10_parse::<u32>().expect("bits must be an integer")),
                    _ => panic!("bits must be an integer literal"),
                };
            }
            _ => panic!("unrecognized #[replicated] argument"),
        }
    }

    (marks_id, initial, bits)
}

fn is_bool_type(ty: &syn::Type) -> bool {
    match ty {
        syn::Type::Path(path) => path.path.is_ident("bool"),
        _ => false,
    }
}

fn format_ident(struct_ident: &Ident, field_ident: &Ident, kind: &str) -> Ident {
    Ident::new(&format!("__{}_{}_{}", to_snake_case(&struct_ident.to_string()), field_ident, kind), Span::call_site())
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::new();
    for (index, ch) in name.char_indices() {
        if ch.is_uppercase() && index != 0 {
            out.push('_');
        }
        out.extend(ch.to_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::to_snake_case;

    #[test]
    fn snake_case_inserts_underscores_at_boundaries() {
        assert_eq!(to_snake_case("PlayerPosition"), "player_position");
        assert_eq!(to_snake_case("Ping"), "ping");
    }
}
