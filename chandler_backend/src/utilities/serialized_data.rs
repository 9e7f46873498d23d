use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encoded document in one of the two supported formats.
///
/// JSON is used for hand-edited show files, CBOR for compact machine-written ones.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedData {
	Cbor(Vec<u8>),
	JSON(serde_json::Value),
}

impl SerializedData {
	/// Guesses the format from the first non-whitespace byte. JSON documents
	/// we write always start with `{`, which is never a valid CBOR map header.
	pub fn sniff(bytes: &[u8]) -> Result<Self, DeserializeError> {
		let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
		return match first {
			Some(b'{') | Some(b'[') => Ok(SerializedData::JSON(serde_json::from_slice(bytes)?)),
			Some(_) => Ok(SerializedData::Cbor(bytes.to_vec())),
			None => Err(DeserializeError(String::from("Empty document"))),
		};
	}

	pub fn deserialize<T: DeserializeOwned>(self) -> Result<T, DeserializeError> {
		let value: T = match self {
			SerializedData::Cbor(data) => ciborium::de::from_reader::<T, &[u8]>(&data)?,
			SerializedData::JSON(data) => serde_json::from_value(data)?,
		};

		return Ok(value);
	}

	pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Self, SerializeError> {
		let mut out = Vec::new();
		ciborium::ser::into_writer(value, &mut out).map_err(|err| SerializeError(err.to_string()))?;
		return Ok(SerializedData::Cbor(out));
	}

	pub fn encode_json<T: Serialize>(value: &T) -> Result<Self, SerializeError> {
		let value = serde_json::to_value(value).map_err(|err| SerializeError(err.to_string()))?;
		return Ok(SerializedData::JSON(value));
	}

	pub fn into_bytes(self) -> Result<Vec<u8>, SerializeError> {
		return match self {
			SerializedData::Cbor(data) => Ok(data),
			SerializedData::JSON(value) => {
				serde_json::to_vec_pretty(&value).map_err(|err| SerializeError(err.to_string()))
			}
		};
	}
}

/// Struct used to support `?` syntax for casting to `Err(...)`.
///
/// Returned when there is an error deserializing `SerializedData`
#[derive(Debug, Clone)]
pub struct DeserializeError(pub String);
impl<T> From<ciborium::de::Error<T>> for DeserializeError {
	fn from(err: ciborium::de::Error<T>) -> Self {
		return DeserializeError(match err {
			ciborium::de::Error::Syntax(offset) => format!("Syntax error at byte {offset}"),
			ciborium::de::Error::Semantic(_, err) => err,
			_ => String::from("An unknown error occurred while deserializing"),
		});
	}
}
impl From<serde_json::Error> for DeserializeError {
	fn from(err: serde_json::Error) -> Self {
		return DeserializeError(err.to_string());
	}
}

#[derive(Debug, Clone)]
pub struct SerializeError(pub String);

#[macro_export]
macro_rules! impl_deserialize_err {
	($type:ty, $output:expr) => {
		impl From<$crate::utilities::serialized_data::DeserializeError> for $type {
			fn from(err: $crate::utilities::serialized_data::DeserializeError) -> Self {
				return $output(err.0);
			}
		}
	};
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;

	#[test]
	fn sniffs_both_formats() {
		let mut doc = BTreeMap::new();
		doc.insert(String::from("name"), String::from("stage"));

		let json = SerializedData::encode_json(&doc).unwrap().into_bytes().unwrap();
		assert!(matches!(SerializedData::sniff(&json).unwrap(), SerializedData::JSON(_)));

		let cbor = SerializedData::encode_cbor(&doc).unwrap().into_bytes().unwrap();
		let decoded: BTreeMap<String, String> = SerializedData::sniff(&cbor).unwrap().deserialize().unwrap();
		assert_eq!(decoded, doc);
	}
}
