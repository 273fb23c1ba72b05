//! テンプレート展開機能
//!
//! 設定ファイル中の文字列にある以下の参照を展開します。
//! - `{config_root}`: 設定ファイルのあるディレクトリ
//! - `{$@}`: `--` 以降の引数
//! - `{images.<key>.image_name}` / `{images.<key>.tag}`
//!
//! それ以外の波括弧はそのまま残すため、シェルの `${VAR}` も壊れません。

use crate::error::{HarpoonError, Result};
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(config_root|\$@|images\.([A-Za-z0-9_\-]+)\.(image_name|tag))\}")
        .expect("reference pattern is valid")
});

/// イメージ名とタグ
#[derive(Debug, Clone)]
pub struct ImageNames {
    pub image_name: String,
    pub tag: Option<String>,
}

/// テンプレートプロセッサ
#[derive(Debug, Clone)]
pub struct TemplateProcessor {
    config_root: PathBuf,
    extra: String,
    images: BTreeMap<String, ImageNames>,
}

impl TemplateProcessor {
    pub fn new(config_root: &Path, extra: impl Into<String>) -> Self {
        Self {
            config_root: config_root.to_path_buf(),
            extra: extra.into(),
            images: BTreeMap::new(),
        }
    }

    /// イメージ名を登録
    pub fn add_image(&mut self, key: impl Into<String>, names: ImageNames) {
        self.images.insert(key.into(), names);
    }

    /// 文字列を展開
    pub fn render(&self, input: &str) -> Result<String> {
        let mut failure = None;
        let rendered = REFERENCE.replace_all(input, |caps: &Captures| {
            match self.lookup(caps) {
                Ok(value) => value,
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(rendered.into_owned()),
        }
    }

    fn lookup(&self, caps: &Captures) -> Result<String> {
        match &caps[1] {
            "config_root" => Ok(self.config_root.display().to_string()),
            "$@" => Ok(self.extra.clone()),
            _ => {
                let key = &caps[2];
                let names = self.images.get(key).ok_or_else(|| HarpoonError::NoSuchImage {
                    image: key.to_string(),
                    available: self.images.keys().cloned().collect(),
                })?;
                match &caps[3] {
                    "image_name" => Ok(names.image_name.clone()),
                    _ => Ok(names.tag.clone().unwrap_or_else(|| "latest".to_string())),
                }
            }
        }
    }

    /// YAML ツリー内のすべての文字列（マップのキーを含む）を展開
    pub fn render_value(&self, value: &mut Value) -> Result<()> {
        match value {
            Value::String(s) => {
                let rendered = self.render(s)?;
                if rendered != *s {
                    debug!(from = %s, to = %rendered, "Expanded template");
                    *s = rendered;
                }
            }
            Value::Sequence(items) => {
                for item in items {
                    self.render_value(item)?;
                }
            }
            Value::Mapping(mapping) => {
                let entries = std::mem::take(mapping);
                for (mut key, mut item) in entries {
                    self.render_value(&mut key)?;
                    self.render_value(&mut item)?;
                    mapping.insert(key, item);
                }
            }
            Value::Tagged(tagged) => self.render_value(&mut tagged.value)?,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> TemplateProcessor {
        let mut processor = TemplateProcessor::new(Path::new("/project"), "--fast");
        processor.add_image(
            "base",
            ImageNames {
                image_name: "team-base".into(),
                tag: Some("v1".into()),
            },
        );
        processor
    }

    #[test]
    fn test_render_references() {
        let rendered = processor()
            .render("{config_root}/src {images.base.image_name}:{images.base.tag} {$@}")
            .unwrap();
        assert_eq!(rendered, "/project/src team-base:v1 --fast");
    }

    #[test]
    fn test_unknown_braces_are_kept() {
        let rendered = processor().render("echo ${HOME} {unknown} {{x}}").unwrap();
        assert_eq!(rendered, "echo ${HOME} {unknown} {{x}}");
    }

    #[test]
    fn test_unknown_image_reference_fails() {
        let err = processor().render("{images.nope.tag}").unwrap_err();
        assert!(matches!(err, HarpoonError::NoSuchImage { image, .. } if image == "nope"));
    }

    #[test]
    fn test_render_value_recurses() {
        let mut value: Value =
            serde_yaml::from_str("a: ['{config_root}']\n'{config_root}/k': 1").unwrap();
        processor().render_value(&mut value).unwrap();
        assert_eq!(value["a"][0], Value::String("/project".into()));
        assert_eq!(value["/project/k"], Value::Number(1.into()));
    }
}
