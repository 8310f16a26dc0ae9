use crate::book::ProductDefinition;
use crate::error::LedgerError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Repository for product definitions
#[async_trait::async_trait]
pub trait ProductRepository: Send + Sync {
	async fn load(&self) -> Result<Vec<ProductDefinition>, LedgerError>;
}

/// YAML file implementation of ProductRepository
pub struct FileProductRepository {
	path: PathBuf,
}

impl FileProductRepository {
	pub fn new(path: PathBuf) -> Self {
		Self { path }
	}
}

#[async_trait::async_trait]
impl ProductRepository for FileProductRepository {
	async fn load(&self) -> Result<Vec<ProductDefinition>, LedgerError> {
		let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
			LedgerError::ProductError(format!(
				"Failed to read products file {:?}: {}",
				self.path, e
			))
		})?;

		let raw: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|e| {
			LedgerError::ProductError(format!("Failed to parse products file: {}", e))
		})?;
		if !raw.is_sequence() {
			return Err(LedgerError::ProductError(
				"Products should be a list".to_string(),
			));
		}
		let definitions: Vec<ProductDefinition> = serde_yaml::from_value(raw).map_err(|e| {
			LedgerError::ProductError(format!("Invalid product definition: {}", e))
		})?;

		debug!(
			"Loaded {} product definitions from {:?}",
			definitions.len(),
			self.path
		);
		Ok(definitions)
	}
}

/// A ledger file made of `include` lines, one per instance ledger.
pub struct IncludeFile {
	path: PathBuf,
}

impl IncludeFile {
	pub fn new(path: PathBuf) -> Self {
		Self { path }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// The directive that includes `target`.
	pub fn include_line(target: &str) -> String {
		format!("include \"{}\"", target)
	}

	/// Whether the file already includes `target`. A missing file includes nothing.
	pub async fn contains(&self, target: &str) -> Result<bool, LedgerError> {
		let content = match tokio::fs::read_to_string(&self.path).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
			Err(e) => return Err(e.into()),
		};
		let line = Self::include_line(target);
		Ok(content.lines().any(|l| l.trim() == line))
	}

	/// Append an include line for `target`, creating the file if needed.
	pub async fn append(&self, target: &str) -> Result<(), LedgerError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let needs_newline = match tokio::fs::read(&self.path).await {
			Ok(bytes) => bytes.last().is_some_and(|b| *b != b'\n'),
			Err(_) => false,
		};
		let mut file = tokio::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.await?;
		let line = format!(
			"{}{}\n",
			if needs_newline { "\n" } else { "" },
			Self::include_line(target)
		);
		file.write_all(line.as_bytes()).await?;
		file.flush().await?;
		info!("Added {} to {:?}", Self::include_line(target), self.path);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_products_must_be_a_list() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("products.yml");
		tokio::fs::write(&path, "name: Club Mate\ncurrency: CM\n")
			.await
			.unwrap();
		let err = FileProductRepository::new(path).load().await.unwrap_err();
		assert!(err.to_string().contains("should be a list"));
	}

	#[tokio::test]
	async fn test_load_products() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("products.yml");
		tokio::fs::write(&path, "- {name: Club Mate, currency: CM, price: 1.5}\n")
			.await
			.unwrap();
		let definitions = FileProductRepository::new(path).load().await.unwrap();
		assert_eq!(definitions.len(), 1);
		assert_eq!(definitions[0].currency, "CM");
	}

	#[tokio::test]
	async fn test_include_file() {
		let dir = tempfile::tempdir().unwrap();
		let file = IncludeFile::new(dir.path().join("ledger/dynamic.beancount"));
		assert!(!file.contains("a.beancount").await.unwrap());

		file.append("a.beancount").await.unwrap();
		file.append("b.beancount").await.unwrap();
		assert!(file.contains("a.beancount").await.unwrap());
		assert!(file.contains("b.beancount").await.unwrap());
		assert!(!file.contains("c.beancount").await.unwrap());

		let content = tokio::fs::read_to_string(file.path()).await.unwrap();
		assert_eq!(content, "include \"a.beancount\"\ninclude \"b.beancount\"\n");
	}
}
