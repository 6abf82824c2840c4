//! 从 LLM 自由文本中提取 JSON 对象
//!
//! 取第一个 `{` 到最后一个 `}` 之间的内容解析；解析失败返回 Malformed，由调用方走各自的降级逻辑。

use serde_json::Value;

/// 提取结果：调用方必须同时处理两种情况
#[derive(Debug, Clone, PartialEq)]
pub enum JsonExtract {
    /// 成功解析出 JSON 对象
    Parsed(Value),
    /// 没有 JSON 块或 JSON 非法，携带原始文本
    Malformed(String),
}

/// 从文本中提取嵌入的 JSON 对象（first `{` .. last `}`）
pub fn extract_json(text: &str) -> JsonExtract {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return JsonExtract::Malformed(text.to_string());
    };
    if end <= start {
        return JsonExtract::Malformed(text.to_string());
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(value) if value.is_object() => JsonExtract::Parsed(value),
        _ => JsonExtract::Malformed(text.to_string()),
    }
}

/// 读取字符串字段；缺失、null 或空串时返回 None
pub fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// 读取布尔字段；兼容 "true"/"false" 字符串
pub fn bool_field(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_embedded_json() {
        let text = "好的，计划如下：\n```json\n{\"reasoning\": \"x\", \"plan\": []}\n```";
        match extract_json(text) {
            JsonExtract::Parsed(v) => assert_eq!(v["reasoning"], "x"),
            JsonExtract::Malformed(_) => panic!("Expected Parsed"),
        }
    }

    #[test]
    fn test_extract_without_braces() {
        assert_eq!(
            extract_json("no json here"),
            JsonExtract::Malformed("no json here".to_string())
        );
    }

    #[test]
    fn test_extract_invalid_json() {
        assert!(matches!(extract_json("{not: valid}"), JsonExtract::Malformed(_)));
        assert!(matches!(extract_json("} reversed {"), JsonExtract::Malformed(_)));
    }

    #[test]
    fn test_bool_field_accepts_strings() {
        let v = serde_json::json!({"a": "true", "b": false, "c": 1});
        assert_eq!(bool_field(&v, "a"), Some(true));
        assert_eq!(bool_field(&v, "b"), Some(false));
        assert_eq!(bool_field(&v, "c"), None);
    }
}
