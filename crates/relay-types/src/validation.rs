//! Validation of implementation-specific TOML tables.
//!
//! Pluggable backends receive their configuration as a raw `toml::Value`.
//! Each one describes the table it accepts with a [`Schema`] and checks it
//! before building anything.

use thiserror::Error;

/// Errors produced while validating a configuration table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
	#[error("Missing required field: {0}")]
	MissingField(String),
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: &'static str,
		actual: String,
	},
}

/// Expected shape of a field.
#[derive(Debug)]
pub enum FieldType {
	String,
	/// Integer with inclusive bounds.
	Integer { min: Option<i64>, max: Option<i64> },
	Boolean,
	/// `0x`-prefixed or bare hex string decoding to exactly `bytes` bytes.
	Hex { bytes: usize },
	Array(Box<FieldType>),
	Table(Schema),
}

/// Custom check run after the type check passes.
pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

/// A named field with its expected type.
pub struct Field {
	pub name: String,
	pub field_type: FieldType,
	pub validator: Option<FieldValidator>,
}

impl std::fmt::Debug for Field {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Field")
			.field("name", &self.name)
			.field("field_type", &self.field_type)
			.finish_non_exhaustive()
	}
}

impl Field {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}

	fn check(&self, path: &str, value: &toml::Value) -> Result<(), ValidationError> {
		check_type(path, value, &self.field_type)?;
		if let Some(validator) = &self.validator {
			validator(value).map_err(|message| ValidationError::InvalidValue {
				field: path.to_string(),
				message,
			})?;
		}
		Ok(())
	}
}

/// Required and optional fields of a TOML table.
#[derive(Debug, Default)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	/// Validates `config`, which must be a table.
	pub fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		self.validate_at("", config)
	}

	fn validate_at(&self, prefix: &str, config: &toml::Value) -> Result<(), ValidationError> {
		let table = config.as_table().ok_or_else(|| ValidationError::TypeMismatch {
			field: if prefix.is_empty() { "root".into() } else { prefix.into() },
			expected: "table",
			actual: config.type_str().to_string(),
		})?;

		for field in &self.required {
			let path = join(prefix, &field.name);
			let value = table
				.get(&field.name)
				.ok_or_else(|| ValidationError::MissingField(path.clone()))?;
			field.check(&path, value)?;
		}

		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				field.check(&join(prefix, &field.name), value)?;
			}
		}

		Ok(())
	}
}

fn join(prefix: &str, name: &str) -> String {
	if prefix.is_empty() {
		name.to_string()
	} else {
		format!("{}.{}", prefix, name)
	}
}

fn mismatch(path: &str, expected: &'static str, value: &toml::Value) -> ValidationError {
	ValidationError::TypeMismatch {
		field: path.to_string(),
		expected,
		actual: value.type_str().to_string(),
	}
}

fn check_type(path: &str, value: &toml::Value, expected: &FieldType) -> Result<(), ValidationError> {
	match expected {
		FieldType::String => {
			value.as_str().ok_or_else(|| mismatch(path, "string", value))?;
		},
		FieldType::Boolean => {
			value.as_bool().ok_or_else(|| mismatch(path, "boolean", value))?;
		},
		FieldType::Integer { min, max } => {
			let n = value
				.as_integer()
				.ok_or_else(|| mismatch(path, "integer", value))?;
			if let Some(min) = min.filter(|min| n < *min) {
				return Err(ValidationError::InvalidValue {
					field: path.to_string(),
					message: format!("Value {} is less than minimum {}", n, min),
				});
			}
			if let Some(max) = max.filter(|max| n > *max) {
				return Err(ValidationError::InvalidValue {
					field: path.to_string(),
					message: format!("Value {} is greater than maximum {}", n, max),
				});
			}
		},
		FieldType::Hex { bytes } => {
			let s = value.as_str().ok_or_else(|| mismatch(path, "hex string", value))?;
			let decoded = hex::decode(crate::without_0x_prefix(s)).map_err(|e| {
				ValidationError::InvalidValue {
					field: path.to_string(),
					message: format!("Invalid hex: {}", e),
				}
			})?;
			if decoded.len() != *bytes {
				return Err(ValidationError::InvalidValue {
					field: path.to_string(),
					message: format!("Expected {} bytes, got {}", bytes, decoded.len()),
				});
			}
		},
		FieldType::Array(inner) => {
			let items = value.as_array().ok_or_else(|| mismatch(path, "array", value))?;
			for (i, item) in items.iter().enumerate() {
				check_type(&format!("{}[{}]", path, i), item, inner)?;
			}
		},
		FieldType::Table(schema) => schema.validate_at(path, value)?,
	}
	Ok(())
}

/// Implemented by every backend to validate its configuration table.
pub trait ConfigSchema: Send + Sync {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError>;
}
