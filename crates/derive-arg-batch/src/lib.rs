use darling::FromMeta;
use proc_macro2::{Span, TokenStream};
use quote::{format_ident, quote};
use syn::{
  parse::Error, parse_macro_input, AttributeArgs, FnArg, GenericArgument, Ident, ItemFn,
  PathArguments, ReturnType, Type,
};

#[derive(FromMeta, Default)]
#[darling(default)]
struct BatchOpt {
  delay_ms: u64,
  name: Option<String>,
}

/// The single generic argument of a path type such as `Vec<T>`, or the first of `Result<T, E>`
fn first_generic<'a>(ty: &'a Type, expected: &str) -> Option<&'a Type> {
  let segment = match ty {
    Type::Path(type_path) => type_path.path.segments.last()?,
    _ => return None,
  };

  if segment.ident != expected {
    return None;
  }

  match &segment.arguments {
    PathArguments::AngleBracketed(args) => match args.args.first()? {
      GenericArgument::Type(ty) => Some(ty),
      _ => None,
    },
    _ => None,
  }
}

/// Parameter types of the generated invoker along with the expression packing them into an
/// argument tuple
fn invoker_params(arg_ty: &Type) -> (Vec<Ident>, Vec<&Type>, TokenStream) {
  match arg_ty {
    Type::Tuple(tuple) => {
      let idents: Vec<Ident> = (0..tuple.elems.len())
        .map(|i| format_ident!("arg{}", i))
        .collect();

      let types: Vec<&Type> = tuple.elems.iter().collect();
      let packed = quote!((#(#idents,)*));

      (idents, types, packed)
    }
    ty => {
      let ident = format_ident!("arg0");
      let packed = quote!(#ident);

      (vec![ident], vec![ty], packed)
    }
  }
}

fn expand(opt: BatchOpt, input: ItemFn) -> syn::Result<TokenStream> {
  let BatchOpt { delay_ms, name } = opt;

  let sig = &input.sig;
  let ident = &sig.ident;
  let vis = &input.vis;

  if !sig.generics.params.is_empty() {
    return Err(Error::new_spanned(
      &sig.generics,
      "batch callbacks cannot be generic",
    ));
  }

  let mut inputs = sig.inputs.iter();

  let batch_ty = match (inputs.next(), inputs.next()) {
    (Some(FnArg::Typed(pat_type)), None) => &*pat_type.ty,
    _ => {
      return Err(Error::new_spanned(
        &sig.inputs,
        "batch callbacks take exactly one `Vec` of argument tuples",
      ));
    }
  };

  let arg_ty = first_generic(batch_ty, "Vec")
    .ok_or_else(|| Error::new_spanned(batch_ty, "batch parameter must be a `Vec`"))?;

  let value_ty = match &sig.output {
    ReturnType::Type(_, ty) => first_generic(ty, "Result"),
    ReturnType::Default => None,
  };

  let value_ty = value_ty
    .ok_or_else(|| Error::new(Span::call_site(), "batch callbacks must return a `Result`"))?;

  let invoker = match name {
    Some(name) => syn::parse_str::<Ident>(&name)?,
    None => format_ident!("{}_batched", ident),
  };

  let build = if sig.asyncness.is_some() {
    quote!(build)
  } else {
    quote!(build_sync)
  };

  let (idents, types, packed) = invoker_params(arg_ty);

  Ok(quote!(
    #input

    #vis fn #invoker(#(#idents: #types),*) -> arg_batch::BatchHandle<#value_ty> {
      thread_local! {
        static BATCHER: arg_batch::Batcher<#arg_ty, #value_ty> = arg_batch::Batcher::builder()
          .delay(std::time::Duration::from_millis(#delay_ms))
          .#build(#ident)
          .expect("batch delay is unsigned");
      }

      BATCHER.with(|batcher| batcher.invoke(#packed))
    }
  ))
}

/// Generate a thread-local batched invoker for a batch callback.
///
/// Applied to `fn name(batch: Vec<(T1, .., Tn)>) -> Result<T, E>` (sync or `async`), the callback is
/// kept as-is and `fn name_batched(arg0: T1, .., argn: Tn) -> arg_batch::BatchHandle<T>` is
/// generated alongside it. Each call of the generated invoker joins the open round of a batcher
/// local to the calling thread. Accepts `delay_ms = u64` and `name = "invoker_name"`.
#[proc_macro_attribute]
pub fn batched(
  args: proc_macro::TokenStream,
  input: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
  let attr_args = parse_macro_input!(args as AttributeArgs);
  let input = parse_macro_input!(input as ItemFn);

  let opt = match BatchOpt::from_list(&attr_args) {
    Ok(attr) => attr,
    Err(err) => {
      return err.write_errors().into();
    }
  };

  match expand(opt, input) {
    Ok(expanded) => expanded.into(),
    Err(err) => err.into_compile_error().into(),
  }
}

#[cfg(test)]
mod test {
  use syn::{parse_quote, ItemFn};

  use crate::{expand, BatchOpt};

  fn expand_err(input: ItemFn) -> String {
    match expand(BatchOpt::default(), input) {
      Ok(expanded) => panic!("expected an error, got `{expanded}`"),
      Err(err) => err.to_string(),
    }
  }

  #[test]
  fn it_generates_invoker_for_tuple_batches() {
    let expanded = expand(
      BatchOpt::default(),
      parse_quote! {
        async fn store(batch: Vec<(u64, String)>) -> Result<usize, std::io::Error> {
          Ok(batch.len())
        }
      },
    )
    .unwrap()
    .to_string();

    assert!(expanded.contains("fn store_batched"));
    assert!(expanded.contains("arg0 : u64 , arg1 : String"));
    assert!(expanded.contains(". build (store)"));
  }

  #[test]
  fn it_renames_sync_invokers() {
    let expanded = expand(
      BatchOpt {
        delay_ms: 5,
        name: Some(String::from("count")),
      },
      parse_quote! {
        fn tally(batch: Vec<String>) -> Result<usize, std::convert::Infallible> {
          Ok(batch.len())
        }
      },
    )
    .unwrap()
    .to_string();

    assert!(expanded.contains("fn count (arg0 : String)"));
    assert!(expanded.contains(". build_sync (tally)"));
    assert!(expanded.contains("from_millis (5u64)"));
  }

  #[test]
  fn it_rejects_generic_callbacks() {
    let err = expand_err(parse_quote! {
      fn store<T>(batch: Vec<T>) -> Result<usize, ()> {
        Ok(batch.len())
      }
    });

    assert_eq!(err, "batch callbacks cannot be generic");
  }

  #[test]
  fn it_rejects_extra_parameters() {
    let err = expand_err(parse_quote! {
      fn store(batch: Vec<u8>, limit: usize) -> Result<usize, ()> {
        Ok(batch.len().min(limit))
      }
    });

    assert_eq!(err, "batch callbacks take exactly one `Vec` of argument tuples");
  }

  #[test]
  fn it_rejects_non_vec_batches() {
    let err = expand_err(parse_quote! {
      fn store(batch: String) -> Result<usize, ()> {
        Ok(batch.len())
      }
    });

    assert_eq!(err, "batch parameter must be a `Vec`");
  }

  #[test]
  fn it_rejects_non_result_returns() {
    let err = expand_err(parse_quote! {
      fn store(batch: Vec<u8>) -> usize {
        batch.len()
      }
    });

    assert_eq!(err, "batch callbacks must return a `Result`");
  }
}
