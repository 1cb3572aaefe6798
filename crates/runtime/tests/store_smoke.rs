//! End to end smoke test of a store running on the production runtime.

use runtime::ProdRuntime;
use store::{
    testing::{
        MockClusterFactory,
        TEST_DESCRIPTOR,
    },
    StoreRegistry,
};

#[test]
fn test_store_on_prod_runtime() -> anyhow::Result<()> {
    let tokio_rt = ProdRuntime::init_tokio()?;
    let rt = ProdRuntime::new(&tokio_rt);
    rt.block_on(async {
        let registry = StoreRegistry::new();
        let factory = MockClusterFactory::new();
        let store = registry.open(rt.clone(), TEST_DESCRIPTOR, &factory).await?;

        let mut txn = store.begin_transaction().await?;
        txn.put(b"greeting".to_vec(), b"hello".to_vec());
        let commit_ts = txn.commit().await?;

        let snapshot = store.snapshot(commit_ts)?;
        assert_eq!(snapshot.get(b"greeting").await?, Some(b"hello".to_vec()));

        store.close().await?;
        assert!(registry.is_empty());
        Ok(())
    })
}
