//! レイヤー解決
//!
//! イメージの依存グラフを深さ優先で辿り、依存が先に来るように層に分けます。

use crate::error::{HarpoonError, Result};
use crate::instruction::dependency_keys;
use crate::model::{Image, ImageSet};
use std::collections::BTreeMap;
use tracing::debug;

/// 同じ層のイメージ（キー順）
pub type Layer<'a> = Vec<(String, &'a Image)>;

/// 依存順に層分けしたイメージ
///
/// 層 i のイメージの依存はすべて層 j < i にある。
/// `only` を指定した場合はそのイメージと推移的な依存だけを含む。
pub fn layered<'a>(images: &'a ImageSet, only: Option<&[String]>) -> Result<Vec<Layer<'a>>> {
    let roots: Vec<String> = match only {
        Some(only) => only.to_vec(),
        None => images.keys(),
    };

    let mut walker = Walker {
        images,
        depths: BTreeMap::new(),
        stack: Vec::new(),
    };
    for key in &roots {
        walker.visit(key)?;
    }

    let max_depth = walker.depths.values().copied().max();
    let mut layers: Vec<Layer<'a>> = match max_depth {
        Some(max) => vec![Vec::new(); max + 1],
        None => Vec::new(),
    };
    // BTreeMap なので各層の中はキー順になる
    for (key, depth) in walker.depths {
        let image = images.require(&key)?;
        layers[depth].push((key, image));
    }

    debug!(layers = layers.len(), "Resolved image layers");
    Ok(layers)
}

/// 依存順に平坦化したキー
pub fn ordered_keys(images: &ImageSet, only: Option<&[String]>) -> Result<Vec<String>> {
    Ok(layered(images, only)?
        .into_iter()
        .flatten()
        .map(|(key, _)| key)
        .collect())
}

/// 実行時の依存（links と share_with）を含めた起動順
///
/// 依存が先、`key` が最後に来る。
pub fn run_order(images: &ImageSet, key: &str) -> Result<Vec<String>> {
    fn visit(
        images: &ImageSet,
        key: &str,
        stack: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(position) = stack.iter().position(|k| k == key) {
            let mut chain = stack[position..].to_vec();
            chain.push(key.to_string());
            return Err(HarpoonError::DependencyCycle { chain });
        }
        if order.iter().any(|k| k == key) {
            return Ok(());
        }

        let image = images.require(key)?;
        stack.push(key.to_string());
        for dep in image.run_dependencies() {
            visit(images, &dep, stack, order)?;
        }
        stack.pop();
        order.push(key.to_string());
        Ok(())
    }

    let mut order = Vec::new();
    visit(images, key, &mut Vec::new(), &mut order)?;
    Ok(order)
}

struct Walker<'a> {
    images: &'a ImageSet,
    depths: BTreeMap<String, usize>,
    stack: Vec<String>,
}

impl Walker<'_> {
    fn visit(&mut self, key: &str) -> Result<usize> {
        if let Some(position) = self.stack.iter().position(|k| k == key) {
            let mut chain = self.stack[position..].to_vec();
            chain.push(key.to_string());
            return Err(HarpoonError::DependencyCycle { chain });
        }
        if let Some(depth) = self.depths.get(key) {
            return Ok(*depth);
        }

        let image = self.images.require(key)?;
        self.stack.push(key.to_string());
        let mut depth = 0;
        for dep in dependency_keys(image) {
            depth = depth.max(self.visit(&dep)? + 1);
        }
        self.stack.pop();

        self.depths.insert(key.to_string(), depth);
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, CommandBody, ContextSpec, Link};

    fn image(key: &str, from: &str, known: bool) -> Image {
        let mut image = Image::new(key, ContextSpec::disabled("/project"));
        image.commands = vec![if known {
            Command {
                action: "FROM".into(),
                body: CommandBody::ImageRef {
                    key: from.into(),
                    before: String::new(),
                    after: String::new(),
                },
            }
        } else {
            Command::text("FROM", from)
        }];
        image
    }

    fn keys(layers: &[Layer<'_>]) -> Vec<Vec<String>> {
        layers
            .iter()
            .map(|layer| layer.iter().map(|(key, _)| key.clone()).collect())
            .collect()
    }

    #[test]
    fn test_layers_follow_dependencies() {
        let mut images = ImageSet::new();
        images.insert(image("a", "scratch", false));
        images.insert(image("b", "a", true));
        images.insert(image("c", "b", true));
        images.insert(image("z", "alpine", false));

        let layers = layered(&images, None).unwrap();
        assert_eq!(keys(&layers), vec![vec!["a", "z"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_only_filter_includes_transitive_dependencies() {
        let mut images = ImageSet::new();
        images.insert(image("a", "scratch", false));
        images.insert(image("b", "a", true));
        images.insert(image("z", "alpine", false));

        let mut web = image("web", "b", true);
        web.links.push(Link {
            image: "z".into(),
            alias: "zed".into(),
        });
        images.insert(web);

        let only = vec!["web".to_string()];
        let layers = layered(&images, Some(&only)).unwrap();
        assert_eq!(keys(&layers), vec![vec!["a", "z"], vec!["b"], vec!["web"]]);
    }

    #[test]
    fn test_cycle_chain_starts_and_ends_with_same_key() {
        let mut images = ImageSet::new();
        images.insert(image("a", "b", true));
        images.insert(image("b", "a", true));

        let only = vec!["a".to_string()];
        let err = layered(&images, Some(&only)).unwrap_err();
        match err {
            HarpoonError::DependencyCycle { chain } => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_root_is_no_such_image() {
        let images = ImageSet::new();
        let only = vec!["ghost".to_string()];
        assert!(matches!(
            layered(&images, Some(&only)),
            Err(HarpoonError::NoSuchImage { .. })
        ));
    }

    #[test]
    fn test_every_dependency_is_in_an_earlier_layer() {
        let mut images = ImageSet::new();
        images.insert(image("base", "debian:12", false));
        for i in 0..6 {
            let parent = if i == 0 { "base".to_string() } else { format!("img{}", i - 1) };
            let mut img = image(&format!("img{i}"), &parent, true);
            if i % 2 == 0 {
                img.volumes.share_with.push("base".into());
            }
            images.insert(img);
        }

        let layers = layered(&images, None).unwrap();
        let mut index = BTreeMap::new();
        for (i, layer) in layers.iter().enumerate() {
            for (key, _) in layer {
                index.insert(key.clone(), i);
            }
        }
        for (key, img) in images.iter() {
            for dep in dependency_keys(img) {
                assert!(index[&dep] < index[key], "{dep} should come before {key}");
            }
        }
    }

    #[test]
    fn test_run_order_puts_linked_images_first() {
        let mut images = ImageSet::new();
        images.insert(image("db", "postgres:16", false));
        images.insert(image("cache", "redis:7", false));
        let mut app = image("app", "python:3", false);
        app.links.push(Link {
            image: "db".into(),
            alias: "db".into(),
        });
        app.volumes.share_with.push("cache".into());
        images.insert(app);

        assert_eq!(run_order(&images, "app").unwrap(), vec!["db", "cache", "app"]);
        assert_eq!(run_order(&images, "db").unwrap(), vec!["db"]);
    }

    #[test]
    fn test_run_order_detects_link_cycles() {
        let mut images = ImageSet::new();
        for (key, other) in [("a", "b"), ("b", "a")] {
            let mut img = image(key, "scratch", false);
            img.links.push(Link {
                image: other.into(),
                alias: other.into(),
            });
            images.insert(img);
        }
        match run_order(&images, "a") {
            Err(HarpoonError::DependencyCycle { chain }) => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
