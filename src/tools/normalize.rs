//! 模型结构化输出的形状归一化
//!
//! 远端模型返回的 JSON 形状不稳定：可能包一层 wrapper、按 visual / verbal 分组、平铺、或使用别名键。
//! 这里按优先级依次尝试一组带标签的策略，每个策略把一种已知形状转换为规范结构；
//! 任何缺失字段从固定默认档案补齐，无法识别的形状退回默认值而不是报错。

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::{ProfileSource, StyleProfile};

/// wrapper 最大剥离层数
const MAX_UNWRAP_DEPTH: usize = 3;

const PROFILE_WRAPPERS: &[&str] = &[
    "style_profile",
    "styleProfile",
    "profile",
    "brand_profile",
    "brandProfile",
    "data",
    "result",
];
const GROUP_KEYS: &[&str] = &["visual", "verbal"];

const PALETTE_KEYS: &[&str] = &["palette", "colors", "color_palette", "colorPalette", "brand_colors"];
const STYLE_KEYS: &[&str] = &[
    "style_description",
    "styleDescription",
    "style",
    "visual_style",
    "aesthetic",
    "description",
];
const VOICE_KEYS: &[&str] = &["voice", "tone", "brand_voice", "brandVoice", "tone_of_voice"];
const FORBIDDEN_KEYS: &[&str] = &[
    "forbidden_elements",
    "forbiddenElements",
    "forbidden",
    "avoid",
    "do_not_use",
    "donts",
];
const RISK_KEYS: &[&str] = &["risk_thresholds", "riskThresholds", "thresholds", "risk", "risks"];

const VALIDATION_WRAPPERS: &[&str] = &["validation", "result", "report", "audit"];
const SCORE_KEYS: &[&str] = &[
    "score",
    "compliance_score",
    "complianceScore",
    "brand_score",
    "rating",
    "overall_score",
];
const PASS_KEYS: &[&str] = &["pass", "passed", "is_compliant", "compliant"];
const ISSUE_KEYS: &[&str] = &["issues", "violations", "problems"];
const FIX_KEYS: &[&str] = &[
    "fix_instructions",
    "fixInstructions",
    "fixes",
    "recommendations",
    "suggestions",
];

/// 已接受的档案形状（按尝试优先级排列）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileShape {
    /// 外面包了一层 {"style_profile": {...}} 之类的 wrapper
    Wrapped,
    /// 按 visual / verbal 分组
    Grouped,
    /// 规范键平铺
    Flat,
    /// 平铺但使用别名键
    Aliased,
}

impl ProfileShape {
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileShape::Wrapped => "wrapped",
            ProfileShape::Grouped => "grouped",
            ProfileShape::Flat => "flat",
            ProfileShape::Aliased => "aliased",
        }
    }
}

/// 归一化结果：值 + 命中的形状（None 表示退回默认值）
#[derive(Clone, Debug, PartialEq)]
pub struct Normalized<T> {
    pub value: T,
    pub shape: Option<ProfileShape>,
}

/// 从模型文本中取出 JSON：整体解析 → ```json 围栏 → 第一个 { 到最后一个 }
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }
    if let Some(start) = trimmed.find("```") {
        let body = &trimmed[start + 3..];
        let body = body.strip_prefix("json").unwrap_or(body);
        if let Some(end) = body.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(body[..end].trim()) {
                return Some(v);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// 把任意已接受形状的档案归一化为规范 StyleProfile
pub fn normalize_profile(raw: &Value) -> Normalized<StyleProfile> {
    match classify_profile(raw, 0) {
        Some((shape, fields)) => Normalized {
            value: read_profile(&fields).with_source(ProfileSource::Extracted),
            shape: Some(shape),
        },
        None => Normalized {
            value: StyleProfile::default_profile(),
            shape: None,
        },
    }
}

fn classify_profile(raw: &Value, depth: usize) -> Option<(ProfileShape, Map<String, Value>)> {
    let obj = raw.as_object()?;

    // wrapped：唯一有效内容在 wrapper 键下
    if depth < MAX_UNWRAP_DEPTH && !has_any(obj, PROFILE_FIELD_KEYS) {
        if let Some(inner) = first_object(obj, PROFILE_WRAPPERS) {
            if let Some((_, fields)) = classify_profile(inner, depth + 1) {
                return Some((ProfileShape::Wrapped, fields));
            }
        }
    }

    // grouped：visual / verbal 子对象合并为一层
    if GROUP_KEYS.iter().any(|k| obj.get(*k).is_some_and(Value::is_object)) {
        let mut merged = Map::new();
        for (k, v) in obj {
            if !GROUP_KEYS.contains(&k.as_str()) {
                merged.insert(k.clone(), v.clone());
            }
        }
        for key in GROUP_KEYS {
            if let Some(Value::Object(group)) = obj.get(*key) {
                for (k, v) in group {
                    merged.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        if has_any(&merged, PROFILE_FIELD_KEYS) {
            return Some((ProfileShape::Grouped, merged));
        }
    }

    let canonical = [
        PALETTE_KEYS[0],
        STYLE_KEYS[0],
        VOICE_KEYS[0],
        FORBIDDEN_KEYS[0],
        RISK_KEYS[0],
    ];
    if canonical.iter().any(|k| obj.contains_key(*k)) {
        return Some((ProfileShape::Flat, obj.clone()));
    }
    if has_any(obj, PROFILE_FIELD_KEYS) {
        return Some((ProfileShape::Aliased, obj.clone()));
    }
    None
}

const PROFILE_FIELD_KEYS: &[&[&str]] = &[PALETTE_KEYS, STYLE_KEYS, VOICE_KEYS, FORBIDDEN_KEYS, RISK_KEYS];

fn has_any(obj: &Map<String, Value>, groups: &[&[&str]]) -> bool {
    groups
        .iter()
        .any(|keys| keys.iter().any(|k| obj.contains_key(*k)))
}

fn first_object<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| v.is_object())
}

/// 规范键优先，其次别名
fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn read_profile(obj: &Map<String, Value>) -> StyleProfile {
    let defaults = StyleProfile::default_profile();

    let palette: Vec<String> = lookup(obj, PALETTE_KEYS)
        .map(string_list)
        .unwrap_or_default()
        .iter()
        .filter_map(|c| normalize_color(c))
        .collect();
    let style_description = lookup(obj, STYLE_KEYS).and_then(text_value);
    let voice = lookup(obj, VOICE_KEYS).and_then(text_value);
    let forbidden_elements = lookup(obj, FORBIDDEN_KEYS)
        .map(string_list)
        .unwrap_or_default();
    let risk_thresholds = lookup(obj, RISK_KEYS)
        .map(number_map)
        .unwrap_or_default();

    StyleProfile {
        palette: non_empty(palette).unwrap_or(defaults.palette),
        style_description: style_description.unwrap_or(defaults.style_description),
        voice: voice.unwrap_or(defaults.voice),
        forbidden_elements: non_empty(forbidden_elements).unwrap_or(defaults.forbidden_elements),
        risk_thresholds: if risk_thresholds.is_empty() {
            defaults.risk_thresholds
        } else {
            risk_thresholds
        },
        source: ProfileSource::Extracted,
    }
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    (!v.is_empty()).then_some(v)
}

/// 字符串、字符串数组（用逗号连接）都接受
fn text_value(v: &Value) -> Option<String> {
    let text = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Array(_) => string_list(v).join(", "),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// 数组（字符串或对象元素）或逗号分隔字符串
fn string_list(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(o) => ["hex", "color", "value", "name", "description"]
                    .iter()
                    .find_map(|k| o.get(*k).and_then(Value::as_str))
                    .map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn number_map(v: &Value) -> BTreeMap<String, f64> {
    let Some(obj) = v.as_object() else {
        return BTreeMap::new();
    };
    obj.iter()
        .filter_map(|(k, v)| as_number(v).map(|n| (k.clone(), n)))
        .collect()
}

/// 十六进制颜色统一为大写带 #；其它颜色名原样保留
pub fn normalize_color(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let hex = s.strip_prefix('#').unwrap_or(s);
    if (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("#{}", hex.to_ascii_uppercase()))
    } else {
        Some(s.to_string())
    }
}

/// 数字，或 "87"、"87/100"、"87%" 形式的字符串
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            let s = s.split('/').next().unwrap_or(s);
            s.trim().trim_end_matches('%').trim().parse().ok()
        }
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "pass" | "passed" => Some(true),
            "false" | "no" | "fail" | "failed" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// 校验发现的问题（可带位置）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Issue {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// 归一化后的校验报告
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationReport {
    /// 0-100
    pub score: f64,
    /// 模型给出的 pass 布尔值（仅供参考）
    pub model_pass: Option<bool>,
    pub issues: Vec<Issue>,
    pub fix_instructions: Vec<String>,
}

/// 归一化校验输出；没有可识别的分数时返回 None
pub fn normalize_validation(raw: &Value) -> Option<ValidationReport> {
    let mut obj = raw.as_object()?;
    for _ in 0..MAX_UNWRAP_DEPTH {
        if lookup(obj, SCORE_KEYS).is_some() {
            break;
        }
        match first_object(obj, VALIDATION_WRAPPERS).and_then(Value::as_object) {
            Some(inner) => obj = inner,
            None => break,
        }
    }

    let score = lookup(obj, SCORE_KEYS).and_then(as_number)?;
    let score = if score.is_finite() { score.clamp(0.0, 100.0) } else { return None };
    let model_pass = lookup(obj, PASS_KEYS).and_then(as_bool);
    let issues = lookup(obj, ISSUE_KEYS).map(issue_list).unwrap_or_default();
    let fix_instructions = lookup(obj, FIX_KEYS).map(string_list).unwrap_or_default();

    Some(ValidationReport {
        score,
        model_pass,
        issues,
        fix_instructions,
    })
}

fn issue_list(v: &Value) -> Vec<Issue> {
    let Some(items) = v.as_array() else {
        return string_list(v)
            .into_iter()
            .map(|description| Issue {
                description,
                location: None,
            })
            .collect();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(Issue {
                description: s.clone(),
                location: None,
            }),
            Value::Object(o) => {
                let description = ["description", "issue", "message", "text"]
                    .iter()
                    .find_map(|k| o.get(*k).and_then(Value::as_str))?
                    .to_string();
                let location = ["location", "region", "area", "bbox"]
                    .iter()
                    .find_map(|k| o.get(*k))
                    .map(|l| match l {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                Some(Issue {
                    description,
                    location,
                })
            }
            _ => None,
        })
        .collect()
}
