//! ビルド命令の解析
//!
//! 命令リストをパースして他イメージへの参照を抽出し、
//! ビルド時には参照を現在のタグに置き換えた Dockerfile と追加ファイルを生成します。

use crate::error::{HarpoonError, Result};
use crate::model::{Command, CommandBody, ContextSpec, Image, ImageSet, ImageSource};
use crate::parser::parse_context_spec;
use regex::Regex;
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

static EXTERNAL_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9.\-]+(?::[0-9]+)?/)?[a-z0-9]+(?:[._\-]+[a-z0-9]+)*(?:/[a-z0-9]+(?:[._\-]+[a-z0-9]+)*)*(?::[A-Za-z0-9_][A-Za-z0-9_.\-]{0,127})?(?:@sha256:[a-f0-9]{64})?$",
    )
    .expect("tag pattern is valid")
});

/// 外部イメージのタグとして妥当か
pub fn is_valid_external_tag(tag: &str) -> bool {
    tag == "scratch" || EXTERNAL_TAG.is_match(tag)
}

/// 命令のパースに必要な情報
pub struct ParseContext<'a> {
    /// 対象イメージのキー（エラー表示用）
    pub image: &'a str,
    /// 設定内のすべてのイメージキー
    pub known: &'a BTreeSet<String>,
    pub config_root: &'a Path,
}

/// 命令リストをパース
///
/// 受け付ける形式:
/// - `"FROM base"`: 文字列
/// - `[action, "body"]` / `[action, [body, ...]]`
/// - `[ADD, {content, dest}]`, `[ADD, {content: {image, path}, dest}]`,
///   `[ADD, {get: [...], prefix}]`, `[ADD, {context, dest}]`
/// - `[COPY, {from, path, to}]`
pub fn parse(raw: &[Value], ctx: &ParseContext<'_>) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for (index, entry) in raw.iter().enumerate() {
        parse_entry(entry, index, ctx, &mut commands)?;
    }

    match commands.first() {
        Some(first) if first.is_from() => Ok(commands),
        Some(first) => Err(HarpoonError::bad_instruction(
            ctx.image,
            format!("The first command must be FROM, got {}", first.action),
        )),
        None => Err(HarpoonError::bad_instruction(
            ctx.image,
            "No commands were specified (a FROM is required)",
        )),
    }
}

fn parse_entry(
    entry: &Value,
    index: usize,
    ctx: &ParseContext<'_>,
    out: &mut Vec<Command>,
) -> Result<()> {
    match entry {
        Value::String(line) => {
            let line = line.trim();
            let (action, body) = match line.split_once(char::is_whitespace) {
                Some((action, body)) => (action, body.trim()),
                None => (line, ""),
            };
            out.push(classify(&normalize_action(action, index, ctx)?, body, ctx)?);
            Ok(())
        }
        Value::Sequence(pair) => {
            let [action, value] = pair.as_slice() else {
                return Err(HarpoonError::bad_instruction(
                    ctx.image,
                    format!("commands[{}]: expected [action, value]", index),
                ));
            };
            let Some(action) = action.as_str() else {
                return Err(HarpoonError::bad_instruction(
                    ctx.image,
                    format!("commands[{}]: the action must be a string", index),
                ));
            };
            let action = normalize_action(action, index, ctx)?;
            match value {
                Value::Sequence(items) => {
                    for item in items {
                        parse_value(&action, item, index, ctx, out)?;
                    }
                    Ok(())
                }
                other => parse_value(&action, other, index, ctx, out),
            }
        }
        _ => Err(HarpoonError::bad_instruction(
            ctx.image,
            format!("commands[{}]: expected a string or [action, value]", index),
        )),
    }
}

fn normalize_action(action: &str, index: usize, ctx: &ParseContext<'_>) -> Result<String> {
    if action.is_empty() || !action.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(HarpoonError::bad_instruction(
            ctx.image,
            format!("commands[{}]: '{}' is not a valid action", index, action),
        ));
    }
    Ok(action.to_ascii_uppercase())
}

fn parse_value(
    action: &str,
    value: &Value,
    index: usize,
    ctx: &ParseContext<'_>,
    out: &mut Vec<Command>,
) -> Result<()> {
    match value {
        Value::String(body) => {
            out.push(classify(action, body.trim(), ctx)?);
            Ok(())
        }
        Value::Number(n) => {
            out.push(classify(action, &n.to_string(), ctx)?);
            Ok(())
        }
        Value::Mapping(_) if action == "ADD" => parse_structured_add(value, index, ctx, out),
        Value::Mapping(_) if action == "COPY" => {
            out.push(parse_structured_copy(value, index, ctx)?);
            Ok(())
        }
        Value::Mapping(_) => Err(HarpoonError::bad_instruction(
            ctx.image,
            format!(
                "commands[{}]: {} does not support the structured form",
                index, action
            ),
        )),
        _ => Err(HarpoonError::bad_instruction(
            ctx.image,
            format!("commands[{}]: unsupported value for {}", index, action),
        )),
    }
}

fn required_str<'v>(value: &'v Value, field: &str, index: usize, ctx: &ParseContext<'_>) -> Result<&'v str> {
    value.get(field).and_then(Value::as_str).ok_or_else(|| {
        HarpoonError::bad_instruction(
            ctx.image,
            format!("commands[{}]: '{}' must be a string", index, field),
        )
    })
}

fn parse_structured_add(
    value: &Value,
    index: usize,
    ctx: &ParseContext<'_>,
    out: &mut Vec<Command>,
) -> Result<()> {
    if let Some(get) = value.get("get") {
        let Some(paths) = get.as_sequence() else {
            return Err(HarpoonError::bad_instruction(
                ctx.image,
                format!("commands[{}]: 'get' must be a list of paths", index),
            ));
        };
        let prefix = match value.get("prefix") {
            Some(prefix) => Some(prefix.as_str().ok_or_else(|| {
                HarpoonError::bad_instruction(
                    ctx.image,
                    format!("commands[{}]: 'prefix' must be a string", index),
                )
            })?),
            None => None,
        };
        for path in paths {
            let Some(path) = path.as_str() else {
                return Err(HarpoonError::bad_instruction(
                    ctx.image,
                    format!("commands[{}]: 'get' entries must be strings", index),
                ));
            };
            let dest = match prefix {
                Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path),
                None => path.to_string(),
            };
            out.push(Command::text("ADD", format!("{} {}", path, dest)));
        }
        return Ok(());
    }

    if let Some(context) = value.get("context") {
        let dest = required_str(value, "dest", index, ctx)?;
        let path = format!("images.{}.commands[{}].context", ctx.image, index);
        let spec = parse_context_spec(Some(context), &path, ctx.config_root)?;
        out.push(Command {
            action: "ADD".into(),
            body: CommandBody::Context {
                context: Box::new(spec),
                dest: dest.to_string(),
            },
        });
        return Ok(());
    }

    match value.get("content") {
        Some(Value::String(content)) => {
            let dest = required_str(value, "dest", index, ctx)?;
            out.push(Command {
                action: "ADD".into(),
                body: CommandBody::InlineContent {
                    content: content.clone(),
                    dest: dest.to_string(),
                },
            });
            Ok(())
        }
        Some(content @ Value::Mapping(_)) => {
            let dest = required_str(value, "dest", index, ctx)?;
            let image = required_str(content, "image", index, ctx)?;
            let path = required_str(content, "path", index, ctx)?;
            out.push(Command {
                action: "ADD".into(),
                body: CommandBody::ImageContent {
                    source: image_source(image, index, ctx)?,
                    path: path.to_string(),
                    dest: dest.to_string(),
                },
            });
            Ok(())
        }
        Some(_) => Err(HarpoonError::bad_instruction(
            ctx.image,
            format!(
                "commands[{}]: 'content' must be a string or {{image, path}}",
                index
            ),
        )),
        None => Err(HarpoonError::bad_instruction(
            ctx.image,
            format!(
                "commands[{}]: structured ADD needs one of content, get or context",
                index
            ),
        )),
    }
}

fn parse_structured_copy(value: &Value, index: usize, ctx: &ParseContext<'_>) -> Result<Command> {
    let from = required_str(value, "from", index, ctx)?;
    let path = required_str(value, "path", index, ctx)?;
    let to = value
        .get("to")
        .or_else(|| value.get("dest"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            HarpoonError::bad_instruction(
                ctx.image,
                format!("commands[{}]: structured COPY needs 'to'", index),
            )
        })?;

    let body = if ctx.known.contains(from) {
        CommandBody::ImageRef {
            key: from.to_string(),
            before: "--from=".into(),
            after: format!(" {} {}", path, to),
        }
    } else {
        CommandBody::Text(format!("--from={} {} {}", from, path, to))
    };
    Ok(Command {
        action: "COPY".into(),
        body,
    })
}

fn image_source(image: &str, index: usize, ctx: &ParseContext<'_>) -> Result<ImageSource> {
    if ctx.known.contains(image) {
        Ok(ImageSource::Key(image.to_string()))
    } else if is_valid_external_tag(image) {
        Ok(ImageSource::External(image.to_string()))
    } else {
        Err(HarpoonError::bad_instruction(
            ctx.image,
            format!(
                "commands[{}]: '{}' is neither an image in the configuration nor a valid tag",
                index, image
            ),
        ))
    }
}

/// 文字列形式の命令を分類（FROM と COPY --from= の参照を検出）
fn classify(action: &str, body: &str, ctx: &ParseContext<'_>) -> Result<Command> {
    let text = || Command::text(action, body);
    match action {
        "FROM" => {
            let tokens: Vec<&str> = body.split_whitespace().collect();
            let Some(position) = tokens.iter().position(|t| !t.starts_with("--")) else {
                return Err(HarpoonError::bad_instruction(
                    ctx.image,
                    "FROM needs an image",
                ));
            };
            let image = tokens[position];
            if ctx.known.contains(image) {
                return Ok(Command {
                    action: action.to_string(),
                    body: CommandBody::ImageRef {
                        key: image.to_string(),
                        before: join_before(&tokens[..position]),
                        after: join_after(&tokens[position + 1..]),
                    },
                });
            }
            // ビルド引数は展開できないのでそのまま
            if image.contains('$') || is_valid_external_tag(image) {
                return Ok(text());
            }
            Err(HarpoonError::bad_instruction(
                ctx.image,
                format!(
                    "FROM '{}' is neither an image in the configuration nor a valid tag",
                    image
                ),
            ))
        }
        "COPY" | "ADD" => {
            let tokens: Vec<&str> = body.split_whitespace().collect();
            let reference = tokens.iter().position(|t| {
                t.strip_prefix("--from=")
                    .is_some_and(|name| ctx.known.contains(name))
            });
            match reference {
                Some(position) => Ok(Command {
                    action: action.to_string(),
                    body: CommandBody::ImageRef {
                        key: tokens[position]["--from=".len()..].to_string(),
                        before: format!("{}--from=", join_before(&tokens[..position])),
                        after: join_after(&tokens[position + 1..]),
                    },
                }),
                None => Ok(text()),
            }
        }
        _ => Ok(text()),
    }
}

fn join_before(tokens: &[&str]) -> String {
    if tokens.is_empty() {
        String::new()
    } else {
        format!("{} ", tokens.join(" "))
    }
}

fn join_after(tokens: &[&str]) -> String {
    if tokens.is_empty() {
        String::new()
    } else {
        format!(" {}", tokens.join(" "))
    }
}

fn stage_name(rest: &str) -> Option<String> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    match tokens.as_slice() {
        [keyword, name, ..] if keyword.eq_ignore_ascii_case("as") => Some(name.to_string()),
        _ => None,
    }
}

/// イメージが依存するイメージ（設定内のキーまたは外部タグ）
///
/// FROM、ADD/COPY の参照、links、volumes.share_with から導出し、出現順で重複を除く。
pub fn dependent_images(image: &Image) -> Vec<ImageSource> {
    let mut deps: Vec<ImageSource> = Vec::new();
    let mut push = |source: ImageSource| {
        if !deps.contains(&source) {
            deps.push(source);
        }
    };

    // マルチステージのステージ名は外部イメージではない
    let mut stages: BTreeSet<String> = BTreeSet::new();
    for command in &image.commands {
        match &command.body {
            CommandBody::ImageRef { key, after, .. } => {
                push(ImageSource::Key(key.clone()));
                if command.is_from() {
                    stages.extend(stage_name(after));
                }
            }
            CommandBody::ImageContent { source, .. } => push(source.clone()),
            CommandBody::Text(body) if command.is_from() => {
                let tokens: Vec<&str> = body.split_whitespace().collect();
                let Some(position) = tokens.iter().position(|t| !t.starts_with("--")) else {
                    continue;
                };
                let name = tokens[position];
                if name != "scratch" && !name.contains('$') && !stages.contains(name) {
                    push(ImageSource::External(name.to_string()));
                }
                stages.extend(stage_name(&tokens[position + 1..].join(" ")));
            }
            _ => {}
        }
    }
    for key in image.run_dependencies() {
        push(ImageSource::Key(key));
    }
    deps
}

/// 依存しているイメージキー
pub fn dependency_keys(image: &Image) -> Vec<String> {
    dependent_images(image)
        .into_iter()
        .filter_map(|source| match source {
            ImageSource::Key(key) => Some(key),
            ImageSource::External(_) => None,
        })
        .collect()
}

/// 外部イメージへの依存（pull-all-external の対象）
pub fn external_dependencies(image: &Image) -> Vec<String> {
    dependent_images(image)
        .into_iter()
        .filter_map(|source| match source {
            ImageSource::External(tag) => Some(tag),
            ImageSource::Key(_) => None,
        })
        .collect()
}

/// コンテキストに追加されるファイル
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraContext {
    /// tar 内でのファイル名
    pub name: String,
    pub source: ExtraSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtraSource {
    Bytes(Vec<u8>),
    /// イメージからパスを取り出した tar
    ImagePath { image_tag: String, path: String },
    /// ディレクトリの tar
    Context(ContextSpec),
}

/// 生成された Dockerfile と追加ファイル
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedInstructions {
    pub dockerfile: String,
    pub extras: Vec<ExtraContext>,
}

/// 命令を Dockerfile に展開
///
/// イメージ参照は `images` にある現在のタグに置き換える。
pub fn render(image: &Image, images: &ImageSet) -> Result<RenderedInstructions> {
    let mut lines = Vec::with_capacity(image.commands.len());
    let mut extras = Vec::new();

    for command in &image.commands {
        let body = match &command.body {
            CommandBody::Text(body) => body.clone(),
            CommandBody::ImageRef { key, before, after } => {
                format!("{}{}{}", before, images.image_tag(key)?, after)
            }
            CommandBody::InlineContent { content, dest } => {
                let name = synthesized_name(&serde_json::json!({ "content": content }), dest, "");
                extras.push(ExtraContext {
                    name: name.clone(),
                    source: ExtraSource::Bytes(content.clone().into_bytes()),
                });
                format!("{} {}", name, dest)
            }
            CommandBody::ImageContent { source, path, dest } => {
                let image_tag = match source {
                    ImageSource::Key(key) => images.image_tag(key)?,
                    ImageSource::External(tag) => tag.clone(),
                };
                let name = synthesized_name(
                    &serde_json::json!({ "image": image_tag, "path": path }),
                    dest,
                    ".tar",
                );
                extras.push(ExtraContext {
                    name: name.clone(),
                    source: ExtraSource::ImagePath {
                        image_tag,
                        path: path.clone(),
                    },
                });
                format!("{} {}", name, dest)
            }
            CommandBody::Context { context, dest } => {
                let description = serde_json::to_value(context.as_ref())
                    .map_err(|e| HarpoonError::bad_instruction(&image.key, e.to_string()))?;
                let name = synthesized_name(&serde_json::json!({ "context": description }), dest, ".tar");
                extras.push(ExtraContext {
                    name: name.clone(),
                    source: ExtraSource::Context(context.as_ref().clone()),
                });
                format!("{} {}", name, dest)
            }
        };

        if body.is_empty() {
            lines.push(command.action.clone());
        } else {
            lines.push(format!("{} {}", command.action, body));
        }
    }

    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');
    Ok(RenderedInstructions { dockerfile, extras })
}

/// `<sha256>-<dest>` 形式の名前
fn synthesized_name(identity: &serde_json::Value, dest: &str, suffix: &str) -> String {
    let digest = Sha256::digest(identity.to_string().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let safe = dest.trim_matches('/').replace('/', "-");
    format!("{}-{}{}", hex, safe, suffix)
}
