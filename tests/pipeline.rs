mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::*;
use prodsearch::builder::{Builder, import_products};
use prodsearch::catalog::NewProduct;
use prodsearch::corpus::{ItemName, ProductEntry};
use prodsearch::db::ledger;
use prodsearch::embedding::Modality;
use prodsearch::error::Error;
use prodsearch::store::{ImageMeta, Include, PersistentStore, VISUAL_IMAGE_COLLECTION};
use rstest::*;
use tokio::time::timeout;

const RED: [u8; 3] = [255, 0, 0];
const GREEN: [u8; 3] = [0, 255, 0];
const BLUE: [u8; 3] = [0, 0, 255];

fn builder(env: &Env, batch_size: usize) -> Builder {
    Builder::new(env.provider.clone(), env.images(), build_options(batch_size))
}

fn product(item_id: &str) -> NewProduct {
    NewProduct {
        item_id: item_id.to_string(),
        product_type: vec!["RING".to_string()],
        item_name: vec![ItemName { language_tag: "en".to_string(), value: "ring".to_string() }],
        main_image: upload(RED),
        other_images: vec![upload(BLUE)],
    }
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(10)]
#[tokio::test]
async fn build_skips_failed_records(#[case] batch_size: usize) -> Result<()> {
    let env = Env::new().await;
    let records = vec![
        env.image("i0", "p0", RED),
        env.image("i1", "p0", GREEN),
        env.missing("i2", "p1"),
        env.image("i3", "p1", BLUE),
        env.image("i4", "p2", [10, 200, 30]),
    ];
    let catalog = env.catalog().await?;

    let report =
        builder(&env, batch_size).build_images(&catalog, Modality::Visual, records).await?;
    assert_eq!(report.total, 5);
    assert_eq!(report.embedded, 4);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.batches_ms.len(), 5usize.div_ceil(batch_size));

    assert_eq!(catalog.count(Modality::Visual).await, 4);
    assert_eq!(ledger::count(catalog.db(), Modality::Visual).await?, 4);

    let mut rows =
        ledger::lookup_positions(catalog.db(), Modality::Visual, &[0, 1, 2, 3, 4]).await?;
    rows.sort_by_key(|r| r.position);
    let positions = rows.iter().map(|r| r.position).collect::<Vec<_>>();
    let image_ids = rows.iter().map(|r| r.image_id.as_str()).collect::<Vec<_>>();
    assert_eq!(positions, vec![0, 1, 2, 3]);
    assert_eq!(image_ids, vec!["i0", "i1", "i3", "i4"]);

    // 重新打开后和账本一致
    drop(catalog);
    let catalog = env.catalog().await?;
    assert_eq!(catalog.count(Modality::Visual).await, 4);
    Ok(())
}

#[tokio::test]
async fn rebuild_replaces_previous_index() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;
    let first = vec![env.image("a", "p", RED), env.image("b", "p", GREEN)];
    builder(&env, 1).build_images(&catalog, Modality::JointImage, first).await?;
    assert_eq!(catalog.count(Modality::JointImage).await, 2);

    let second = vec![env.image("c", "q", BLUE)];
    builder(&env, 1).build_images(&catalog, Modality::JointImage, second).await?;
    assert_eq!(catalog.count(Modality::JointImage).await, 1);
    let rows = ledger::lookup_positions(catalog.db(), Modality::JointImage, &[0, 1]).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].image_id, "c");

    // 其他模态不受影响
    assert_eq!(catalog.count(Modality::Visual).await, 0);
    Ok(())
}

#[tokio::test]
async fn build_with_nothing_embedded_publishes_nothing() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;
    builder(&env, 2)
        .build_images(&catalog, Modality::Visual, vec![env.image("a", "p", RED)])
        .await?;

    let records = vec![env.missing("x", "p"), env.missing("y", "p")];
    let report = builder(&env, 2).build_images(&catalog, Modality::Visual, records).await?;
    assert_eq!(report.embedded, 0);
    assert_eq!(report.skipped, 2);
    assert_eq!(catalog.count(Modality::Visual).await, 1);
    assert_eq!(ledger::count(catalog.db(), Modality::Visual).await?, 1);
    Ok(())
}

#[tokio::test]
async fn build_skips_duplicate_image_ids() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;
    let records = vec![env.image("a", "p", RED), env.image("a", "q", GREEN)];
    let report = builder(&env, 1).build_images(&catalog, Modality::Visual, records).await?;
    assert_eq!((report.embedded, report.skipped), (1, 1));
    let rows =
        ledger::lookup_by_image_ids(catalog.db(), Modality::Visual, &["a".to_string()]).await?;
    assert_eq!(rows[0].item_id, "p");
    Ok(())
}

#[tokio::test]
async fn failed_publish_keeps_previous_state() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;
    let records = vec![env.image("a", "p", RED), env.image("b", "p", GREEN)];
    builder(&env, 2).build_images(&catalog, Modality::Visual, records).await?;
    let published = std::fs::read(env.index_path(Modality::Visual))?;

    // 临时文件的位置被目录占用，写入失败
    std::fs::create_dir_all(tmp_path(&env.index_path(Modality::Visual)))?;
    let records = vec![env.image("c", "q", BLUE)];
    let r = builder(&env, 2).build_images(&catalog, Modality::Visual, records).await;
    assert!(r.is_err());

    assert_eq!(catalog.count(Modality::Visual).await, 2);
    assert_eq!(ledger::count(catalog.db(), Modality::Visual).await?, 2);
    assert_eq!(std::fs::read(env.index_path(Modality::Visual))?, published);

    std::fs::remove_dir(tmp_path(&env.index_path(Modality::Visual)))?;
    drop(catalog);
    let catalog = env.catalog().await?;
    assert_eq!(catalog.count(Modality::Visual).await, 2);
    Ok(())
}

#[tokio::test]
async fn interrupted_publish_is_rolled_forward() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;
    let records = vec![env.image("a", "p", RED), env.image("b", "p", GREEN)];
    builder(&env, 2).build_images(&catalog, Modality::Visual, records).await?;
    drop(catalog);

    // 模拟账本已提交但是重命名没有完成
    let path = env.index_path(Modality::Visual);
    std::fs::rename(&path, tmp_path(&path))?;
    std::fs::write(&path, b"stale")?;

    let catalog = env.catalog().await?;
    assert_eq!(catalog.count(Modality::Visual).await, 2);
    assert!(!tmp_path(&path).exists());
    Ok(())
}

#[tokio::test]
async fn corrupted_index_is_reported() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;
    builder(&env, 2)
        .build_images(&catalog, Modality::Visual, vec![env.image("a", "p", RED)])
        .await?;
    drop(catalog);

    std::fs::write(env.index_path(Modality::Visual), b"corrupted")?;
    assert!(matches!(env.catalog().await, Err(Error::Persistence(_))));
    Ok(())
}

#[tokio::test]
async fn add_product_appends_to_both_image_indices() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;

    let added = catalog.add_product(product("P1")).await?;
    assert!(added.main_image_id.starts_with("P1"));
    assert_eq!(added.main_image_id.len(), 2 + 7);
    assert_eq!(added.other_image_id.len(), 1);
    assert_eq!(env.provider.calls(), 4);

    for modality in Modality::IMAGE {
        assert_eq!(catalog.count(modality).await, 2);
        let rows = ledger::lookup_positions(catalog.db(), modality, &[0, 1]).await?;
        assert_eq!(rows.len(), 2);
    }

    let view = catalog.product("P1").await?;
    assert_eq!(view.main_image.image_id, added.main_image_id);
    assert!(view.main_image.image_path.starts_with("new/"));
    assert!(env.images().join(&view.main_image.image_path).exists());
    assert_eq!(view.other_images.len(), 1);

    // 追加后重新打开，校验和一致
    drop(catalog);
    let catalog = env.catalog().await?;
    assert_eq!(catalog.count(Modality::JointImage).await, 2);
    Ok(())
}

#[tokio::test]
async fn duplicate_product_is_rejected_without_side_effects() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;
    catalog.add_product(product("P1")).await?;
    let calls = env.provider.calls();

    let r = catalog.add_product(product("P1")).await;
    assert!(matches!(r, Err(Error::Validation(_))));
    assert_eq!(env.provider.calls(), calls);
    for modality in Modality::IMAGE {
        assert_eq!(catalog.count(modality).await, 2);
        assert_eq!(ledger::count(catalog.db(), modality).await?, 2);
    }
    let saved = std::fs::read_dir(env.images().join("new"))?.count();
    assert_eq!(saved, 2);
    Ok(())
}

#[tokio::test]
async fn add_product_after_external_rebuild_is_rejected() -> Result<()> {
    let env = Env::new().await;
    let server = env.catalog().await?;
    let records =
        vec![env.image("a", "p", RED), env.image("b", "p", GREEN), env.image("c", "p", BLUE)];
    builder(&env, 10).build_images(&server, Modality::Visual, records).await?;

    // 另一个进程重新发布了视觉索引，server 内存中仍是旧的 3 条向量
    let other = env.catalog().await?;
    let records = vec![env.image("d", "q", RED)];
    builder(&env, 10).build_images(&other, Modality::Visual, records).await?;

    let r = server.add_product(product("P")).await;
    assert!(matches!(r, Err(Error::Persistence(_))));
    assert_eq!(server.count(Modality::Visual).await, 3);
    assert_eq!(ledger::count(server.db(), Modality::Visual).await?, 1);
    assert_eq!(ledger::count(server.db(), Modality::JointImage).await?, 0);
    assert!(prodsearch::db::product::find_by_item_id(server.db(), "P").await?.is_none());
    assert!(!tmp_path(&env.index_path(Modality::Visual)).exists());

    // 重新加载后可以正常追加
    drop(server);
    drop(other);
    let catalog = env.catalog().await?;
    assert_eq!(catalog.count(Modality::Visual).await, 1);
    catalog.add_product(product("P")).await?;
    assert_eq!(catalog.count(Modality::Visual).await, 3);
    let mut rows = ledger::lookup_positions(catalog.db(), Modality::Visual, &[0, 1, 2]).await?;
    rows.sort_by_key(|r| r.position);
    assert_eq!(rows.iter().map(|r| r.position).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(rows[0].image_id, "d");
    Ok(())
}

#[tokio::test]
async fn rebuild_waits_for_readers_before_publishing_ledger() -> Result<()> {
    let env = Env::new().await;
    let catalog = Arc::new(env.catalog().await?);
    let old = vec![env.image("old0", "p", RED), env.image("old1", "p", GREEN)];
    builder(&env, 10).build_images(&catalog, Modality::Visual, old).await?;

    // 模拟一个正在进行的搜索
    let snapshot = catalog.index(Modality::Visual).clone().read_owned().await;

    let new = vec![env.image("new0", "q", BLUE), env.image("new1", "q", RED)];
    let b = builder(&env, 10);
    let c = catalog.clone();
    let mut rebuild = tokio::spawn(async move { b.build_images(&c, Modality::Visual, new).await });

    assert!(timeout(Duration::from_millis(300), &mut rebuild).await.is_err());
    let rows = ledger::lookup_positions(catalog.db(), Modality::Visual, &[0, 1]).await?;
    assert_eq!(snapshot.count(), 2);
    assert!(rows.iter().all(|r| r.image_id.starts_with("old")));

    drop(snapshot);
    let report = rebuild.await??;
    assert_eq!(report.embedded, 2);
    let rows = ledger::lookup_positions(catalog.db(), Modality::Visual, &[0, 1]).await?;
    assert!(rows.iter().all(|r| r.image_id.starts_with("new")));
    Ok(())
}

#[tokio::test]
async fn non_image_upload_is_rejected() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;

    let mut request = product("P2");
    request.other_images[0].content_type = Some("text/plain".to_string());
    assert!(matches!(catalog.add_product(request).await, Err(Error::Validation(_))));

    let mut request = product("P2");
    request.main_image.bytes = b"not an image".to_vec();
    assert!(matches!(catalog.add_product(request).await, Err(Error::Validation(_))));

    assert_eq!(env.provider.calls(), 0);
    assert_eq!(catalog.count(Modality::Visual).await, 0);
    assert!(matches!(catalog.product("P2").await, Err(Error::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn import_products_replaces_table() -> Result<()> {
    let env = Env::new().await;
    let products: Vec<ProductEntry> = serde_json::from_str(
        r#"[
            {"item_id": "P1", "product_type": [{"value": "RING"}], "main_image_id": "a"},
            {"item_id": "P1", "product_type": "NECKLACE"},
            {"item_id": "P2", "other_image_id": ["b"]}
        ]"#,
    )?;
    assert_eq!(import_products(&env.db, products).await?, 2);

    let catalog = env.catalog().await?;
    let view = catalog.product("P1").await?;
    assert_eq!(view.product_type, vec!["RING"]);
    // 账本中没有的图片路径为空
    assert_eq!(view.main_image.image_path, "");

    assert_eq!(import_products(&env.db, vec![]).await?, 0);
    assert!(matches!(catalog.product("P1").await, Err(Error::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn build_text_index_skips_items_without_description() -> Result<()> {
    let env = Env::new().await;
    let catalog = env.catalog().await?;
    let products: Vec<ProductEntry> = serde_json::from_str(
        r#"[
            {"item_id": "P1", "metadata": {"category": "ring", " Stone": "red ruby"}},
            {"item_id": "P2", "metadata": {"category": "not found"}},
            {"item_id": "P3", "metadata": {"stone Color": "blue"}}
        ]"#,
    )?;

    let report = builder(&env, 10).build_texts(&catalog, products).await?;
    assert_eq!((report.total, report.embedded, report.skipped), (3, 2, 1));
    assert_eq!(catalog.count(Modality::JointText).await, 2);

    let item_ids = vec!["P1".to_string(), "P3".to_string()];
    let rows = ledger::item_text_positions(catalog.db(), &item_ids).await?;
    let p1 = rows.iter().find(|r| r.item_id == "P1").unwrap();
    assert_eq!(p1.metadata_text, "category: ring, Stone: red ruby");
    Ok(())
}

#[tokio::test]
async fn build_store_collection() -> Result<()> {
    let env = Env::new().await;
    let store = PersistentStore::new(env.db.clone());
    let records = vec![env.image("a", "p", RED), env.missing("b", "p"), env.image("c", "q", BLUE)];

    let report = builder(&env, 2).build_store_images(&store, Modality::Visual, records).await?;
    assert_eq!((report.embedded, report.skipped), (2, 1));
    assert_eq!(store.count(VISUAL_IMAGE_COLLECTION).await?, 2);
    assert_eq!(store.count(&format!("{VISUAL_IMAGE_COLLECTION}_staging")).await?, 0);

    let ids = vec!["c".to_string()];
    let include = Include { embeddings: false, metadata: true };
    let r = store.get::<ImageMeta>(VISUAL_IMAGE_COLLECTION, &ids, include).await?;
    assert_eq!(r.metadata.unwrap()[0].item_id, "q");

    // 全部失败时保留原有集合
    let report = builder(&env, 2)
        .build_store_images(&store, Modality::Visual, vec![env.missing("x", "p")])
        .await?;
    assert_eq!(report.embedded, 0);
    assert_eq!(store.count(VISUAL_IMAGE_COLLECTION).await?, 2);
    Ok(())
}
