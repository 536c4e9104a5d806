//! Multi-file configuration loading.
//!
//! A root file may list other files under `include`. Included files are
//! merged into the root at the top level; a section defined twice is an
//! error rather than a silent override.

use crate::{resolve_env_vars, Config, ConfigError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Loads a root configuration file together with its includes.
pub(crate) struct ConfigLoader {
	base_path: PathBuf,
	/// Canonical paths already read, for cycle detection.
	visited: HashSet<PathBuf>,
	/// Top-level section name to the file that defined it.
	owners: HashMap<String, PathBuf>,
}

impl ConfigLoader {
	pub(crate) fn new(base_path: impl AsRef<Path>) -> Self {
		Self {
			base_path: base_path.as_ref().to_path_buf(),
			visited: HashSet::new(),
			owners: HashMap::new(),
		}
	}

	/// Reads `root`, merges every included file and parses the result.
	pub(crate) async fn load_config(&mut self, root: impl AsRef<Path>) -> Result<Config, ConfigError> {
		let root = self.locate(root)?;
		let content = self.read(&root).await?;
		let mut document: toml::Value = toml::from_str(&content)?;

		let includes = take_includes(&mut document)?;
		if includes.is_empty() {
			return content.parse();
		}

		self.claim_sections(&document, &root)?;
		for include in includes {
			let path = self.locate(&include)?;
			let included: toml::Value = toml::from_str(&self.read(&path).await?)?;
			if included.get("include").is_some() {
				return Err(ConfigError::Validation(format!(
					"Nested include in {} is not supported",
					path.display()
				)));
			}
			self.claim_sections(&included, &path)?;
			if let (Some(target), toml::Value::Table(source)) = (document.as_table_mut(), included) {
				target.extend(source);
			}
		}

		let merged = toml::to_string(&document)
			.map_err(|e| ConfigError::Parse(format!("Failed to serialize merged config: {}", e)))?;
		merged.parse()
	}

	async fn read(&mut self, path: &Path) -> Result<String, ConfigError> {
		let canonical = path.canonicalize().map_err(|e| {
			ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Cannot resolve path {}: {}", path.display(), e),
			))
		})?;
		if !self.visited.insert(canonical.clone()) {
			return Err(ConfigError::Validation(format!(
				"Circular include detected: {} was already loaded",
				canonical.display()
			)));
		}

		let content = tokio::fs::read_to_string(path).await?;
		resolve_env_vars(&content)
	}

	fn claim_sections(&mut self, document: &toml::Value, source: &Path) -> Result<(), ConfigError> {
		let Some(table) = document.as_table() else {
			return Ok(());
		};
		for key in table.keys() {
			if let Some(owner) = self.owners.get(key) {
				return Err(ConfigError::Validation(format!(
					"Duplicate section '{}' found in {} and {}",
					key,
					owner.display(),
					source.display()
				)));
			}
			self.owners.insert(key.clone(), source.to_path_buf());
		}
		Ok(())
	}

	fn locate(&self, path: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
		let path = path.as_ref();
		let resolved = if path.is_absolute() {
			path.to_path_buf()
		} else {
			self.base_path.join(path)
		};

		if !resolved.exists() {
			return Err(ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Configuration file not found: {}", resolved.display()),
			)));
		}
		Ok(resolved)
	}
}

/// Removes and returns the `include` directive, accepting a string or an
/// array of strings.
fn take_includes(document: &mut toml::Value) -> Result<Vec<PathBuf>, ConfigError> {
	let Some(value) = document.as_table_mut().and_then(|t| t.remove("include")) else {
		return Ok(Vec::new());
	};

	match value {
		toml::Value::String(path) => Ok(vec![PathBuf::from(path)]),
		toml::Value::Array(items) => items
			.into_iter()
			.map(|item| match item {
				toml::Value::String(path) => Ok(PathBuf::from(path)),
				_ => Err(ConfigError::Validation(
					"Include array must contain only strings".into(),
				)),
			})
			.collect(),
		_ => Err(ConfigError::Validation(
			"Include must be a string or array of strings".into(),
		)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tests::SAMPLE;
	use std::fs;
	use tempfile::TempDir;

	/// Splits the sample so that `[relay]` stays in the root file.
	fn split_sample() -> (&'static str, &'static str) {
		let at = SAMPLE.find("[source]").unwrap();
		SAMPLE.split_at(at)
	}

	#[tokio::test]
	async fn test_single_file_config() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("relay.toml");
		fs::write(&path, SAMPLE).unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let config = loader.load_config(&path).await.unwrap();
		assert_eq!(config.relay.id, "relay-test");
	}

	#[tokio::test]
	async fn test_config_with_includes() {
		let temp_dir = TempDir::new().unwrap();
		let (relay, rest) = split_sample();
		fs::write(
			temp_dir.path().join("main.toml"),
			format!("include = [\"chains.toml\"]\n{}", relay),
		)
		.unwrap();
		fs::write(temp_dir.path().join("chains.toml"), rest).unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let config = loader.load_config("main.toml").await.unwrap();
		assert_eq!(config.relay.id, "relay-test");
		assert_eq!(config.destination.chain_id, 256);
		assert_eq!(config.storage.primary, "memory");
	}

	#[tokio::test]
	async fn test_single_string_include() {
		let temp_dir = TempDir::new().unwrap();
		let (relay, rest) = split_sample();
		fs::write(
			temp_dir.path().join("main.toml"),
			format!("include = \"chains.toml\"\n{}", relay),
		)
		.unwrap();
		fs::write(temp_dir.path().join("chains.toml"), rest).unwrap();

		let config = Config::from_file(temp_dir.path().join("main.toml").to_str().unwrap())
			.await
			.unwrap();
		assert_eq!(config.source.name, "ethereum");
	}

	#[tokio::test]
	async fn test_duplicate_section_error() {
		let temp_dir = TempDir::new().unwrap();
		fs::write(
			temp_dir.path().join("main.toml"),
			"include = [\"duplicate.toml\"]\n[relay]\nid = \"a\"\n",
		)
		.unwrap();
		fs::write(temp_dir.path().join("duplicate.toml"), "[relay]\nid = \"b\"\n").unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let err = loader.load_config("main.toml").await.unwrap_err();
		assert!(err.to_string().contains("Duplicate section 'relay'"));
	}

	#[tokio::test]
	async fn test_self_include_detection() {
		let temp_dir = TempDir::new().unwrap();
		fs::write(
			temp_dir.path().join("self.toml"),
			"include = [\"self.toml\"]\n[relay]\nid = \"a\"\n",
		)
		.unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let err = loader.load_config("self.toml").await.unwrap_err();
		assert!(err.to_string().contains("already loaded"));
	}

	#[tokio::test]
	async fn test_missing_include() {
		let temp_dir = TempDir::new().unwrap();
		fs::write(
			temp_dir.path().join("main.toml"),
			"include = [\"absent.toml\"]\n[relay]\nid = \"a\"\n",
		)
		.unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		assert!(matches!(
			loader.load_config("main.toml").await,
			Err(ConfigError::Io(_))
		));
	}
}
