//! 設定全体とイメージレジストリ

use super::{HarpoonOptions, Image, ImageTask};
use crate::error::{HarpoonError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 読み込み済みの設定
#[derive(Debug, Clone)]
pub struct HarpoonConfig {
    /// 設定ファイルのあるディレクトリ
    pub config_root: PathBuf,
    pub harpoon: HarpoonOptions,
    pub images: ImageSet,
    /// レジストリ名 → 認証設定
    pub authentication: BTreeMap<String, Authentication>,
    /// トップレベルおよびイメージごとのタスク
    pub tasks: BTreeMap<String, ImageTask>,
}

/// イメージキーで引けるイメージの集合
///
/// 依存関係はポインタではなくキーで表す。
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    images: BTreeMap<String, Image>,
}

impl ImageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: Image) {
        self.images.insert(image.key.clone(), image);
    }

    pub fn get(&self, key: &str) -> Option<&Image> {
        self.images.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Image> {
        self.images.get_mut(key)
    }

    /// 見つからなければ `NoSuchImage`
    pub fn require(&self, key: &str) -> Result<&Image> {
        self.images.get(key).ok_or_else(|| HarpoonError::NoSuchImage {
            image: key.to_string(),
            available: self.keys(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.images.contains_key(key)
    }

    /// ソート済みのキー一覧
    pub fn keys(&self) -> Vec<String> {
        self.images.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Image)> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// 現在のタグ
    pub fn image_tag(&self, key: &str) -> Result<String> {
        self.require(key).map(|image| image.image_tag())
    }
}

impl FromIterator<Image> for ImageSet {
    fn from_iter<T: IntoIterator<Item = Image>>(iter: T) -> Self {
        let mut set = ImageSet::new();
        for image in iter {
            set.insert(image);
        }
        set
    }
}

/// レジストリ認証設定
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Authentication {
    pub reading: Option<AuthMethod>,
    pub writing: Option<AuthMethod>,
}

/// 認証情報の取得方法
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AuthMethod {
    Plain { username: String, password: String },
    Environment { username_env: String, password_env: String },
}
