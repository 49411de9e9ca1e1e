use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use log::{info, warn};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::Product;
use crate::error::{Error, Result};

/// 语料中的一张图片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusRecord {
    pub image_id: String,
    pub item_id: String,
    /// 相对于图片根目录的路径
    pub image_path: String,
}

/// 商品名称，可能有多种语言
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ItemName {
    #[serde(default = "default_language_tag")]
    pub language_tag: String,
    pub value: String,
}

fn default_language_tag() -> String {
    "en".to_string()
}

/// 商品 JSON 中的一条记录
#[derive(Debug, Clone, Deserialize)]
pub struct ProductEntry {
    pub item_id: String,
    #[serde(default, deserialize_with = "deserialize_product_types")]
    pub product_type: Vec<String>,
    #[serde(default)]
    pub item_name: Vec<ItemName>,
    #[serde(default)]
    pub main_image_id: Option<String>,
    #[serde(default)]
    pub other_image_id: Vec<String>,
    #[serde(default)]
    pub metadata: ProductAttributes,
}

impl ProductEntry {
    pub fn into_product(self) -> Product {
        Product {
            item_id: self.item_id,
            product_type: self.product_type,
            item_name: self.item_name,
            main_image_id: self.main_image_id.unwrap_or_default(),
            other_image_id: self.other_image_id,
        }
    }
}

/// 参与生成商品描述文本的属性
///
/// 别名对应原始数据集中的键名，其中有些带有多余的空格
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProductAttributes {
    #[serde(default, alias = "Category", deserialize_with = "lenient_string")]
    pub category: Option<String>,
    #[serde(default, alias = "sub Category", deserialize_with = "lenient_string")]
    pub sub_category: Option<String>,
    #[serde(default, alias = " Style", alias = "Style", deserialize_with = "lenient_string")]
    pub style: Option<String>,
    #[serde(default, alias = " Stone", alias = "Stone", deserialize_with = "lenient_string")]
    pub stone: Option<String>,
    #[serde(default, alias = "stone Color", deserialize_with = "lenient_string")]
    pub stone_color: Option<String>,
    #[serde(default, alias = "stone Shape", deserialize_with = "lenient_string")]
    pub stone_shape: Option<String>,
    #[serde(default, alias = "stone Setting", deserialize_with = "lenient_string")]
    pub stone_setting: Option<String>,
}

/// 把商品属性转换成一段描述文本，形如 `category: ring, Stone: diamond`
///
/// 空值和 "not found" 会被跳过，所有属性都为空时返回空字符串
pub fn metadata_to_text(attrs: &ProductAttributes) -> String {
    let fields = [
        ("category", &attrs.category),
        ("sub Category", &attrs.sub_category),
        ("Style", &attrs.style),
        ("Stone", &attrs.stone),
        ("stone Color", &attrs.stone_color),
        ("stone Shape", &attrs.stone_shape),
        ("stone Setting", &attrs.stone_setting),
    ];
    fields
        .into_iter()
        .filter_map(|(label, value)| {
            let value = value.as_deref()?.trim();
            if value.is_empty() || value.eq_ignore_ascii_case("not found") {
                return None;
            }
            Some(format!("{label}: {value}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// 解析表单中的商品名称
///
/// 支持 JSON 数组、单个 JSON 对象，其余情况当作英文名称
pub fn parse_item_names(raw: &str) -> Vec<ItemName> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        List(Vec<ItemName>),
        One(ItemName),
    }

    match serde_json::from_str::<Names>(raw) {
        Ok(Names::List(names)) => names,
        Ok(Names::One(name)) => vec![name],
        Err(_) => vec![ItemName { language_tag: default_language_tag(), value: raw.to_string() }],
    }
}

pub fn load_corpus(path: impl AsRef<Path>) -> Result<Vec<CorpusRecord>> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    let records: Vec<CorpusRecord> = serde_json::from_slice(&data)
        .map_err(|e| Error::validation(format!("语料格式错误: {}: {e}", path.display())))?;
    info!("读取语料: {} 条图片记录", records.len());
    Ok(records)
}

/// 读取商品列表并按 item_id 去重，重复时保留第一条
pub fn load_products(path: impl AsRef<Path>) -> Result<Vec<ProductEntry>> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    let products: Vec<ProductEntry> = serde_json::from_slice(&data)
        .map_err(|e| Error::validation(format!("商品数据格式错误: {}: {e}", path.display())))?;
    let total = products.len();
    let products = dedup_products(products);
    if products.len() != total {
        warn!("商品数据中有 {} 条重复的 item_id", total - products.len());
    }
    info!("读取商品: {} 条", products.len());
    Ok(products)
}

pub fn dedup_products(products: Vec<ProductEntry>) -> Vec<ProductEntry> {
    let mut seen = HashSet::new();
    products.into_iter().filter(|p| seen.insert(p.item_id.clone())).collect()
}

/// 商品类型在数据集中是 `[{"value": "RING"}]`，在表单和数据库中是字符串
fn deserialize_product_types<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ProductType {
        Plain(String),
        Tagged { value: String },
    }

    struct ProductTypesVisitor;

    impl<'de> Visitor<'de> for ProductTypesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a product type or a list of product types")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(vec![])
        }

        fn visit_seq<A: SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut types = vec![];
            while let Some(t) = seq.next_element::<ProductType>()? {
                types.push(match t {
                    ProductType::Plain(v) | ProductType::Tagged { value: v } => v,
                });
            }
            Ok(types)
        }
    }

    deserializer.deserialize_any(ProductTypesVisitor)
}

/// 把字符串、数字和布尔值都读成字符串
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_to_text() {
        let attrs: ProductAttributes = serde_json::from_str(
            r#"{
                "category": "Ring",
                "sub Category": "Band",
                " Style": "",
                " Stone": "Diamond",
                "stone Color": "not found",
                "stone Shape": " Round ",
                "weight": "3g"
            }"#,
        )
        .unwrap();
        assert_eq!(
            metadata_to_text(&attrs),
            "category: Ring, sub Category: Band, Stone: Diamond, stone Shape: Round"
        );
        assert_eq!(metadata_to_text(&ProductAttributes::default()), "");
    }

    #[test]
    fn test_parse_item_names() {
        assert_eq!(
            parse_item_names("Gold ring"),
            vec![ItemName { language_tag: "en".into(), value: "Gold ring".into() }]
        );
        assert_eq!(
            parse_item_names(r#"{"language_tag": "de", "value": "Ring"}"#),
            vec![ItemName { language_tag: "de".into(), value: "Ring".into() }]
        );
        let names = parse_item_names(r#"[{"value": "a"}, {"language_tag": "fr", "value": "b"}]"#);
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].language_tag, "en");
        assert_eq!(parse_item_names("42")[0].value, "42");
    }

    #[test]
    fn test_product_entry() {
        let p: ProductEntry = serde_json::from_str(
            r#"{
                "item_id": "B01",
                "product_type": [{"value": "RING"}],
                "item_name": [{"language_tag": "en_US", "value": "Ring"}],
                "main_image_id": "img1",
                "metadata": {"category": 1}
            }"#,
        )
        .unwrap();
        assert_eq!(p.product_type, vec!["RING"]);
        assert_eq!(p.metadata.category.as_deref(), Some("1"));
        let product = p.into_product();
        assert_eq!(product.main_image_id, "img1");
        assert!(product.other_image_id.is_empty());

        let p: ProductEntry =
            serde_json::from_str(r#"{"item_id": "B02", "product_type": "SHOES"}"#).unwrap();
        assert_eq!(p.product_type, vec!["SHOES"]);
    }

    #[test]
    fn test_dedup_products_first_wins() {
        let products: Vec<ProductEntry> = serde_json::from_str(
            r#"[
                {"item_id": "a", "main_image_id": "1"},
                {"item_id": "b"},
                {"item_id": "a", "main_image_id": "2"}
            ]"#,
        )
        .unwrap();
        let products = dedup_products(products);
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].main_image_id.as_deref(), Some("1"));
    }
}
