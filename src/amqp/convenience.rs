use amq_protocol_types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use std::borrow::{Borrow, Cow};

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }
}

impl BasicPropertiesExt for BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Build an AMQP long string header value.
pub fn string_value(value: impl Into<String>) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value.into()))
}

/// Copy every entry of `overrides` into `base`, replacing entries that share a key.
///
/// # Example
///
/// ```rust
/// use carrot_relay::amqp::convenience::{merge_headers, string_value};
/// use carrot_relay::amqp::types::{FieldTable, ShortString};
///
/// let mut base = FieldTable::default();
/// base.insert("env".into(), string_value("production"));
/// base.insert("source".into(), string_value("billing"));
///
/// let mut overrides = FieldTable::default();
/// overrides.insert("env".into(), string_value("staging"));
///
/// let merged = merge_headers(base, Some(&overrides));
/// assert_eq!(2, merged.inner().len());
/// assert_eq!(
///     Some(&string_value("staging")),
///     merged.inner().get(&ShortString::from("env"))
/// );
/// ```
pub fn merge_headers(mut base: FieldTable, overrides: Option<&FieldTable>) -> FieldTable {
    if let Some(overrides) = overrides {
        for (key, value) in overrides.inner() {
            base.insert(key.clone(), value.clone());
        }
    }
    base
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// We consume the `properties` input to make sure the caller does not re-use
/// it under the impression that it has been mutated to add the new header.
#[cfg(test)]
pub(crate) fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.to_owned())
        .unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}
