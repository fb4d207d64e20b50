//! Merging of values split across stream messages.
//!
//! Strings concatenate. Lists concatenate, except that the last element of
//! the head and the first element of the tail are merged recursively when
//! both are strings or both are lists. Nothing else can be chunked.

use spanpool_core::{Error, ErrorCode, Result, Value};

pub(crate) fn merge(head: Value, tail: Value) -> Result<Value> {
    match (head, tail) {
        (Value::String(mut head), Value::String(tail)) => {
            head.push_str(&tail);
            Ok(Value::String(head))
        }
        (Value::List(mut head), Value::List(tail)) => {
            let mut rest = tail.into_iter();
            match (head.pop(), rest.next()) {
                (Some(last), Some(first)) if can_merge(&last, &first) => {
                    head.push(merge(last, first)?);
                }
                (Some(last), Some(first)) => {
                    head.push(last);
                    head.push(first);
                }
                (Some(only), None) | (None, Some(only)) => head.push(only),
                (None, None) => {}
            }
            head.extend(rest);
            Ok(Value::List(head))
        }
        (head, tail) => Err(Error::new(
            ErrorCode::Internal,
            format!("cannot merge chunked {} value with {}", head.kind(), tail.kind()),
        )),
    }
}

fn can_merge(last: &Value, first: &Value) -> bool {
    matches!(
        (last, first),
        (Value::String(_), Value::String(_)) | (Value::List(_), Value::List(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::from(v)
    }

    #[test]
    fn strings_concatenate() {
        assert_eq!(merge(s("hel"), s("lo")).unwrap(), s("hello"));
    }

    #[test]
    fn list_boundary_strings_merge() {
        let head = Value::List(vec![s("a"), s("bc")]);
        let tail = Value::List(vec![s("d"), s("e")]);
        assert_eq!(
            merge(head, tail).unwrap(),
            Value::List(vec![s("a"), s("bcd"), s("e")])
        );
    }

    #[test]
    fn list_boundary_numbers_concatenate() {
        let head = Value::List(vec![Value::Number(1.0)]);
        let tail = Value::List(vec![Value::Number(2.0), Value::Number(3.0)]);
        assert_eq!(
            merge(head, tail).unwrap(),
            Value::List(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)])
        );
    }

    #[test]
    fn nested_lists_merge_recursively() {
        let head = Value::List(vec![Value::List(vec![s("x"), s("y")])]);
        let tail = Value::List(vec![Value::List(vec![s("z")]), s("w")]);
        assert_eq!(
            merge(head, tail).unwrap(),
            Value::List(vec![Value::List(vec![s("x"), s("yz")]), s("w")])
        );
    }

    #[test]
    fn empty_lists_merge() {
        let merged = merge(Value::List(vec![]), Value::List(vec![s("a")])).unwrap();
        assert_eq!(merged, Value::List(vec![s("a")]));
    }

    #[test]
    fn scalars_cannot_be_chunked() {
        let err = merge(Value::Bool(true), Value::Bool(false)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(merge(Value::Number(1.0), Value::Number(2.0)).is_err());
    }

    #[test]
    fn mismatched_kinds_fail() {
        let err = merge(s("a"), Value::List(vec![])).unwrap_err();
        assert!(err.message().contains("string"));
        assert!(err.message().contains("list"));
    }
}
