//! Derives `SSHEncode` and `SSHDecode` for `dusk::sshwire`.
//!
//! Used by `packets.rs`. Decoded values are owned, so generated `SSHDecode`
//! impls carry no lifetime parameters.
//!
//! `SSHWIRE_DEBUG` environment variable can be set at build time
//! to write generated files to the `target/` directory.

use std::collections::HashSet;
use std::env;

use proc_macro::{Delimiter, Span};
use virtue::generate::FnSelfArg;
use virtue::parse::{Attribute, AttributeLocation, EnumBody, StructBody};
use virtue::prelude::*;
use virtue::utils::{parse_tagged_attribute, ParsedAttribute};

const ENV_SSHWIRE_DEBUG: &str = "SSHWIRE_DEBUG";

#[proc_macro_derive(SSHEncode, attributes(sshwire))]
pub fn derive_encode(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    encode_inner(input).unwrap_or_else(|e| e.into_token_stream())
}

#[proc_macro_derive(SSHDecode, attributes(sshwire))]
pub fn derive_decode(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    decode_inner(input).unwrap_or_else(|e| e.into_token_stream())
}

fn encode_inner(input: TokenStream) -> Result<TokenStream> {
    let parse = Parse::new(input)?;
    let (mut gen, att, body) = parse.into_generator();
    match body {
        Body::Struct(body) => encode_struct(&mut gen, body)?,
        Body::Enum(body) => encode_enum(&mut gen, &att, body)?,
    }
    if env::var(ENV_SSHWIRE_DEBUG).is_ok() {
        gen.export_to_file("sshwire", "SSHEncode");
    }
    gen.finish()
}

fn decode_inner(input: TokenStream) -> Result<TokenStream> {
    let parse = Parse::new(input)?;
    let (mut gen, att, body) = parse.into_generator();
    match body {
        Body::Struct(body) => decode_struct(&mut gen, body)?,
        Body::Enum(body) => decode_enum(&mut gen, &att, body)?,
    }
    if env::var(ENV_SSHWIRE_DEBUG).is_ok() {
        gen.export_to_file("sshwire", "SSHDecode");
    }
    gen.finish()
}

#[derive(Debug)]
enum ContainerAtt {
    /// The variant name string is written before the enum contents.
    /// `#[sshwire(variant_prefix)]`
    VariantPrefix,

    /// Don't generate SSHEncodeEnum. Can't be used with SSHDecode derive.
    /// `#[sshwire(no_variant_names)]`
    NoNames,
}

#[derive(Debug)]
enum FieldAtt {
    /// The named enum field's variant name is encoded before this field.
    /// eg `#[sshwire(variant_name = req)]` for `ChannelRequest`
    VariantName(Ident),
    /// Unrecognised variant names are captured by this variant,
    /// which can't be written out.
    /// `#[sshwire(unknown)]`
    CaptureUnknown,
    /// The wire name of a variant.
    /// `#[sshwire(variant = "exit-signal")]` or
    /// `#[sshwire(variant = SSH_NAME_ED25519)]`
    Variant(TokenTree),
}

fn custom_err(msg: &str, span: Option<Span>) -> Error {
    Error::Custom { error: msg.into(), span }
}

fn container_atts(atts: &[Attribute]) -> Result<Vec<ContainerAtt>> {
    let mut ret = vec![];
    for a in atts.iter().filter_map(|a| parse_tagged_attribute(&a.tokens, "sshwire").transpose()) {
        for a in a? {
            let c = match a {
                ParsedAttribute::Tag(l) if l.to_string() == "no_variant_names" => ContainerAtt::NoNames,
                ParsedAttribute::Tag(l) if l.to_string() == "variant_prefix" => ContainerAtt::VariantPrefix,
                _ => return Err(custom_err("Unknown sshwire attribute", None)),
            };
            ret.push(c);
        }
    }
    Ok(ret)
}

/// Expects `= <tokentree>` following an attribute keyword
fn att_value(g: &mut impl Iterator<Item = TokenTree>, a: &Attribute) -> Result<TokenTree> {
    match g.next() {
        Some(TokenTree::Punct(p)) if p == '=' => (),
        _ => return Err(custom_err("Missing '='", Some(a.tokens.span()))),
    }
    g.next().ok_or_else(|| custom_err("Missing expression", Some(a.tokens.span())))
}

// virtue's parse_tagged_attribute() doesn't handle literals, so this is by hand.
fn field_atts(atts: &[Attribute]) -> Result<Vec<FieldAtt>> {
    let mut ret = vec![];
    for a in atts {
        if !matches!(a.location, AttributeLocation::Field | AttributeLocation::Variant) {
            return Err(custom_err("Unexpected attribute location", Some(a.tokens.span())));
        }
        let mut s = a.tokens.stream().into_iter();
        match s.next() {
            Some(TokenTree::Ident(i)) if i.to_string() == "sshwire" => (),
            // some other attribute such as a doc comment
            _ => continue,
        }

        let Some(TokenTree::Group(g)) = s.next() else {
            return Err(custom_err(
                "#[sshwire(...)] attribute is missing (...) part",
                Some(a.tokens.span()),
            ));
        };
        let mut g = g.stream().into_iter();
        let f = match g.next() {
            Some(TokenTree::Ident(l)) if l.to_string() == "variant_name" => {
                match att_value(&mut g, a)? {
                    TokenTree::Ident(i) => FieldAtt::VariantName(i),
                    _ => return Err(Error::ExpectedIdent(a.tokens.span())),
                }
            }
            Some(TokenTree::Ident(l)) if l.to_string() == "unknown" => FieldAtt::CaptureUnknown,
            Some(TokenTree::Ident(l)) if l.to_string() == "variant" => {
                FieldAtt::Variant(att_value(&mut g, a)?)
            }
            _ => return Err(custom_err("Unknown sshwire attribute", Some(a.tokens.span()))),
        };
        if g.next().is_some() {
            return Err(custom_err("Extra unhandled parts", Some(a.tokens.span())));
        }
        ret.push(f);
    }
    Ok(ret)
}

fn is_unknown(atts: &[FieldAtt]) -> bool {
    atts.iter().any(|a| matches!(a, FieldAtt::CaptureUnknown))
}

fn variant_wire_name(name: &Ident, atts: Vec<FieldAtt>) -> Result<TokenTree> {
    let mut v: Vec<TokenTree> = atts
        .into_iter()
        .filter_map(|a| match a {
            FieldAtt::Variant(t) => Some(t),
            _ => None,
        })
        .collect();
    if v.len() != 1 {
        return Err(custom_err(
            &format!("One #[sshwire(variant = ...)] attribute is required for variant {name}"),
            None,
        ));
    }
    v.pop().ok_or_else(|| custom_err("missing variant", None))
}

/// Only unit variants or single-value tuple variants are handled
fn check_variant_fields(fields: &Option<Fields>) -> Result<bool> {
    match fields {
        None => Ok(false),
        Some(Fields::Tuple(f)) if f.len() == 1 => Ok(true),
        _ => Err(custom_err(
            "sshwire derive only handles unit or single value enum variants",
            None,
        )),
    }
}

fn encode_struct(gen: &mut Generator, body: StructBody) -> Result<()> {
    gen.impl_for("crate::sshwire::SSHEncode")
        .generate_fn("enc")
        .with_generic_deps("E", ["crate::sshwire::SSHSink"])
        .with_self_arg(FnSelfArg::RefSelf)
        .with_arg("s", "&mut E")
        .with_return_type("crate::sshwire::WireResult<()>")
        .body(|fn_body| {
            match &body.fields {
                Some(Fields::Tuple(v)) => {
                    // newtypes only
                    for (fname, f) in v.iter().enumerate() {
                        if !f.attributes.is_empty() {
                            return Err(custom_err(
                                "Attributes aren't allowed for tuple structs",
                                Some(f.span()),
                            ));
                        }
                        fn_body.push_parsed(format!(
                            "crate::sshwire::SSHEncode::enc(&self.{fname}, s)?;"
                        ))?;
                    }
                }
                Some(Fields::Struct(v)) => {
                    for (fname, f) in v {
                        for a in field_atts(&f.attributes)? {
                            if let FieldAtt::VariantName(enum_field) = a {
                                fn_body.push_parsed(format!(
                                    "crate::sshwire::SSHEncode::enc(&crate::sshwire::SSHEncodeEnum::variant_name(&self.{enum_field})?, s)?;"
                                ))?;
                            }
                        }
                        fn_body.push_parsed(format!(
                            "crate::sshwire::SSHEncode::enc(&self.{fname}, s)?;"
                        ))?;
                    }
                }
                None => (),
            }
            fn_body.push_parsed("Ok(())")?;
            Ok(())
        })?;
    Ok(())
}

fn encode_enum(gen: &mut Generator, atts: &[Attribute], body: EnumBody) -> Result<()> {
    let cont_atts = container_atts(atts)?;

    gen.impl_for("crate::sshwire::SSHEncode")
        .generate_fn("enc")
        .with_generic_deps("S", ["crate::sshwire::SSHSink"])
        .with_self_arg(FnSelfArg::RefSelf)
        .with_arg("s", "&mut S")
        .with_return_type("crate::sshwire::WireResult<()>")
        .body(|fn_body| {
            if cont_atts.iter().any(|c| matches!(c, ContainerAtt::VariantPrefix)) {
                fn_body.push_parsed(
                    "crate::sshwire::SSHEncode::enc(&crate::sshwire::SSHEncodeEnum::variant_name(self)?, s)?;",
                )?;
            }

            fn_body.push_parsed("match self")?;
            fn_body.group(Delimiter::Brace, |match_arm| {
                for var in &body.variants {
                    let atts = field_atts(&var.attributes)?;
                    let has_value = check_variant_fields(&var.fields)?;
                    let pat = if has_value { "(i)" } else { "" };
                    let rhs = if is_unknown(&atts) {
                        "return Err(crate::sshwire::WireError::UnknownVariant)".to_string()
                    } else if has_value {
                        "crate::sshwire::SSHEncode::enc(i, s)?".to_string()
                    } else {
                        String::new()
                    };
                    match_arm.push_parsed(format!("Self::{}{pat} => {{ {rhs} }}", var.name))?;
                }
                Ok(())
            })?;
            fn_body.push_parsed("Ok(())")?;
            Ok(())
        })?;

    if !cont_atts.iter().any(|c| matches!(c, ContainerAtt::NoNames)) {
        encode_enum_names(gen, body)?;
    }
    Ok(())
}

fn encode_enum_names(gen: &mut Generator, body: EnumBody) -> Result<()> {
    gen.impl_for("crate::sshwire::SSHEncodeEnum")
        .generate_fn("variant_name")
        .with_self_arg(FnSelfArg::RefSelf)
        .with_return_type("crate::sshwire::WireResult<&'static str>")
        .body(|fn_body| {
            fn_body.push_parsed("let r = match self")?;
            fn_body.group(Delimiter::Brace, |match_arm| {
                for var in &body.variants {
                    let atts = field_atts(&var.attributes)?;
                    let pat = if check_variant_fields(&var.fields)? { "(_)" } else { "" };
                    match_arm.push_parsed(format!("Self::{}{pat} => ", var.name))?;
                    match_arm.group(Delimiter::Brace, |var_body| {
                        if is_unknown(&atts) {
                            var_body.push_parsed(
                                "return Err(crate::sshwire::WireError::UnknownVariant)",
                            )?;
                        } else {
                            var_body.push(variant_wire_name(&var.name, atts)?);
                        }
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
            fn_body.push_parsed("; Ok(r)")?;
            Ok(())
        })?;
    Ok(())
}

fn decode_struct(gen: &mut Generator, body: StructBody) -> Result<()> {
    gen.impl_for("crate::sshwire::SSHDecode")
        .generate_fn("dec")
        .with_generic_deps("S", ["crate::sshwire::SSHSource"])
        .with_arg("s", "&mut S")
        .with_return_type("crate::sshwire::WireResult<Self>")
        .body(|fn_body| {
            let mut named_enums = HashSet::new();
            if let Some(Fields::Struct(v)) = &body.fields {
                for (fname, f) in v {
                    for a in field_atts(&f.attributes)? {
                        if let FieldAtt::VariantName(enum_field) = a {
                            // the wire carries the enum's name ahead of this field
                            named_enums.insert(enum_field.to_string());
                            fn_body.push_parsed(format!(
                                "let enum_name_{enum_field}: crate::sshwire::BinString = crate::sshwire::SSHDecode::dec(s)?;"
                            ))?;
                        }
                    }
                    if named_enums.contains(&fname.to_string()) {
                        fn_body.push_parsed(format!(
                            "let field_{fname} = crate::sshwire::SSHDecodeEnum::dec_enum(s, enum_name_{fname}.as_ref())?;"
                        ))?;
                    } else {
                        fn_body.push_parsed(format!(
                            "let field_{fname} = crate::sshwire::SSHDecode::dec(s)?;"
                        ))?;
                    }
                }
            }

            match &body.fields {
                Some(Fields::Tuple(f)) => {
                    let args: String = f
                        .iter()
                        .map(|_| "crate::sshwire::SSHDecode::dec(s)?,")
                        .collect();
                    fn_body.push_parsed(format!("Ok(Self({args}))"))?;
                }
                Some(Fields::Struct(v)) => {
                    let args: String =
                        v.iter().map(|(fname, _)| format!("{fname}: field_{fname},")).collect();
                    fn_body.push_parsed(format!("Ok(Self {{ {args} }})"))?;
                }
                None => {
                    fn_body.push_parsed("Ok(Self {})")?;
                }
            }
            Ok(())
        })?;
    Ok(())
}

fn decode_enum(gen: &mut Generator, atts: &[Attribute], body: EnumBody) -> Result<()> {
    let cont_atts = container_atts(atts)?;

    if cont_atts.iter().any(|c| matches!(c, ContainerAtt::NoNames)) {
        return Err(custom_err(
            "SSHDecode derive can't be used with #[sshwire(no_variant_names)]",
            None,
        ));
    }

    // Self describing enums read their own name first
    if cont_atts.iter().any(|c| matches!(c, ContainerAtt::VariantPrefix)) {
        gen.impl_for("crate::sshwire::SSHDecode")
            .generate_fn("dec")
            .with_generic_deps("S", ["crate::sshwire::SSHSource"])
            .with_arg("s", "&mut S")
            .with_return_type("crate::sshwire::WireResult<Self>")
            .body(|fn_body| {
                fn_body.push_parsed(
                    "let variant: crate::sshwire::BinString = crate::sshwire::SSHDecode::dec(s)?;",
                )?;
                fn_body.push_parsed(
                    "crate::sshwire::SSHDecodeEnum::dec_enum(s, variant.as_ref())",
                )?;
                Ok(())
            })?;
    }

    decode_enum_names(gen, &body)
}

fn decode_enum_names(gen: &mut Generator, body: &EnumBody) -> Result<()> {
    gen.impl_for("crate::sshwire::SSHDecodeEnum")
        .generate_fn("dec_enum")
        .with_generic_deps("S", ["crate::sshwire::SSHSource"])
        .with_arg("s", "&mut S")
        .with_arg("variant", "&[u8]")
        .with_return_type("crate::sshwire::WireResult<Self>")
        .body(|fn_body| {
            // Some(ascii_string), or None
            fn_body.push_parsed("let var_str = crate::sshwire::try_as_ascii_str(variant).ok();")?;

            fn_body.push_parsed("let r = match var_str")?;
            fn_body.group(Delimiter::Brace, |match_arm| {
                // the catch-all arm must come last
                let mut unknown_arm = None;
                for var in &body.variants {
                    let atts = field_atts(&var.attributes)?;
                    let has_value = check_variant_fields(&var.fields)?;
                    if is_unknown(&atts) {
                        if unknown_arm.is_some() {
                            return Err(custom_err(
                                "only one variant can have #[sshwire(unknown)]",
                                None,
                            ));
                        }
                        unknown_arm = Some(format!(
                            "_ => {{ s.ctx().seen_unknown = true; Self::{}(crate::packets::Unknown::from(variant)) }}",
                            var.name
                        ));
                    } else {
                        let wire_name = variant_wire_name(&var.name, atts)?;
                        match_arm.push_parsed(format!("Some({wire_name}) => "))?;
                        match_arm.group(Delimiter::Brace, |var_body| {
                            if has_value {
                                var_body.push_parsed(format!(
                                    "Self::{}(crate::sshwire::SSHDecode::dec(s)?)",
                                    var.name
                                ))?;
                            } else {
                                var_body.push_parsed(format!("Self::{}", var.name))?;
                            }
                            Ok(())
                        })?;
                    }
                }
                match unknown_arm {
                    Some(a) => match_arm.push_parsed(a)?,
                    None => match_arm.push_parsed(
                        "_ => return Err(crate::sshwire::WireError::UnknownVariant)",
                    )?,
                };
                Ok(())
            })?;
            fn_body.push_parsed("; Ok(r)")?;
            Ok(())
        })?;
    Ok(())
}
