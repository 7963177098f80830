//! 設定値ノードのパース

use crate::error::{ConfigError, Result};
use crate::model::{ConfigValue, ResourceAddress};
use kdl::{KdlNode, KdlValue};
use std::collections::BTreeMap;

/// 子ノードを設定値に変換
///
/// - 子ブロックあり → Map
/// - 引数1つ → スカラー
/// - 引数複数 → List
/// - 引数なし → Null
///
/// 子ブロックと引数の併用、同じブロック内でのキーの重複はエラーです。
pub fn parse_config_node(node: &KdlNode, stack: &str) -> Result<ConfigValue> {
    let arguments: Vec<&KdlValue> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
        .collect();

    if let Some(children) = node.children() {
        let name = node.name().value();
        if !arguments.is_empty() {
            return Err(ConfigError::InvalidConfig(format!(
                "'{}' には引数と子ブロックを同時に指定できません",
                name
            )));
        }

        let mut map = BTreeMap::new();
        for child in children.nodes() {
            let key = child.name().value();
            if map.contains_key(key) {
                return Err(ConfigError::InvalidConfig(format!(
                    "'{}' 内でキー '{}' が重複しています",
                    name, key
                )));
            }
            map.insert(key.to_string(), parse_config_node(child, stack)?);
        }
        return Ok(ConfigValue::Map(map));
    }

    let mut values = arguments
        .into_iter()
        .map(|value| parse_scalar(value, stack))
        .collect::<Result<Vec<_>>>()?;

    Ok(match values.len() {
        0 => ConfigValue::Null,
        1 => values.remove(0),
        _ => ConfigValue::List(values),
    })
}

fn parse_scalar(value: &KdlValue, stack: &str) -> Result<ConfigValue> {
    if let Some(s) = value.as_string() {
        return parse_interpolated(s, stack);
    }
    if let Some(i) = value.as_integer() {
        let i = i64::try_from(i)
            .map_err(|_| ConfigError::InvalidConfig(format!("整数が大きすぎます: {}", i)))?;
        return Ok(ConfigValue::Integer(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(ConfigValue::Float(f));
    }
    if let Some(b) = value.as_bool() {
        return Ok(ConfigValue::Bool(b));
    }
    Ok(ConfigValue::Null)
}

/// `${...}` を含む文字列をパース
///
/// 文字列全体が `${res.attr}` なら参照そのもの、一部に含まれていれば Concat になります。
pub fn parse_interpolated(s: &str, stack: &str) -> Result<ConfigValue> {
    let mut parts = Vec::new();
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        let end = rest[start..].find('}').ok_or_else(|| {
            ConfigError::InvalidConfig(format!("閉じられていない参照があります: {}", s))
        })? + start;

        if start > 0 {
            parts.push(ConfigValue::String(rest[..start].to_string()));
        }
        parts.push(parse_reference(&rest[start + 2..end], stack)?);
        rest = &rest[end + 1..];
    }

    if parts.is_empty() {
        return Ok(ConfigValue::String(s.to_string()));
    }
    if !rest.is_empty() {
        parts.push(ConfigValue::String(rest.to_string()));
    }

    if parts.len() == 1 {
        Ok(parts.remove(0))
    } else {
        Ok(ConfigValue::Concat(parts))
    }
}

/// `res.attr` または `stack.res.attr` を参照に変換
fn parse_reference(path: &str, stack: &str) -> Result<ConfigValue> {
    let segments: Vec<&str> = path.trim().split('.').collect();
    let (target, attribute) = match segments.as_slice() {
        [resource, attribute] => (ResourceAddress::new(stack, *resource), *attribute),
        [target_stack, resource, attribute] => {
            (ResourceAddress::new(*target_stack, *resource), *attribute)
        }
        _ => {
            return Err(ConfigError::InvalidConfig(format!(
                "参照は ${{resource.attr}} または ${{stack.resource.attr}} 形式で指定してください: ${{{}}}",
                path
            )));
        }
    };

    if target.stack.is_empty() || target.resource.is_empty() || attribute.is_empty() {
        return Err(ConfigError::InvalidConfig(format!(
            "参照に空の要素があります: ${{{}}}",
            path
        )));
    }

    Ok(ConfigValue::reference(target, attribute))
}

/// `res` または `stack.res` をアドレスに変換
pub fn parse_address(s: &str, stack: &str) -> Result<ResourceAddress> {
    if s.contains('.') {
        s.parse()
    } else if s.is_empty() {
        Err(ConfigError::InvalidConfig(
            "depends-on に空のリソース名が指定されています".to_string(),
        ))
    } else {
        Ok(ResourceAddress::new(stack, s))
    }
}
