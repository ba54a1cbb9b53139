/// LiveFilter - Coordinated Dimensional Filtering
///
/// A columnar dataset shared by many views. Each view contributes a filter
/// through a `Dimension`; the `DataStore` combines every active filter into
/// one canonical set of row indices and pushes it to listeners. `DataModel`s
/// project that set into sorted views, the `ChartManager` routes charts and
/// highlights between views, and a `SyncBridge` mirrors filters, highlights
/// and chart pop-outs to peer sessions.
///
/// ```
/// use livefilter::{CategoryDictionary, Column, ColumnStore, DataStore, Predicate};
///
/// let dictionary = CategoryDictionary::from_values(["A", "B"]);
/// let store = DataStore::new(
///     ColumnStore::new(
///         "cells",
///         4,
///         vec![
///             Column::float64("x", vec![0.5, 1.5, 2.5, 3.5]),
///             Column::categorical_from_codes("group", vec![0, 1, 0, 0], dictionary),
///         ],
///     )
///     .unwrap(),
/// );
///
/// let x = store.add_dimension("x");
/// let group = store.add_dimension("group");
/// x.filter(Predicate::range("x", 1.0, 4.0)).unwrap();
/// group.filter(Predicate::category("group", "A")).unwrap();
///
/// assert_eq!(&store.last_delivered().indices()[..], &[2, 3]);
/// ```

pub mod dictionary;
pub mod column;
pub mod store;
pub mod predicate;
pub mod dimension;
pub mod event;
pub mod datastore;
pub mod model;
pub mod charts;
pub mod messages;
pub mod sync;
pub mod hub;
pub mod config;
pub mod error;

pub use dictionary::{CategoryCode, CategoryDictionary, DictionaryStats};
pub use column::{Column, ColumnType, ColumnValue};
pub use store::ColumnStore;
pub use predicate::{point_in_polygon, Predicate};
pub use dimension::{Dimension, DimensionId, DimensionScope};
pub use event::{FilteredIndices, Generation, HighlightState, RowIndex, StoreEvent};
pub use datastore::{DataStore, ListenerOptions};
pub use model::{DataModel, ModelOptions, ModelUpdate, SortKey, SortOrder};
pub use charts::{ChartManager, PopoutOutcome, PopoutState};
pub use messages::SyncMessage;
pub use sync::{PeerLink, SyncBridge};
pub use hub::{ConnectionId, PeerSession, PeerSink, SyncHub};
pub use config::{ServerConfig, SyncConfig};
pub use error::{
    ComputeError, ConfigurationError, LiveFilterError, Result, RoutingError, TransportError,
};

// WebSocket server modules - only when server feature is enabled
#[cfg(feature = "server")]
pub mod websocket;
#[cfg(feature = "server")]
pub mod server;

// WebSocket client transport - only when client feature is enabled
#[cfg(feature = "client")]
pub mod client;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn grouped_store() -> DataStore {
        let groups = ["A", "B", "B", "A", "A", "B", "A", "B", "A", "A"];
        DataStore::new(
            ColumnStore::new(
                "cells",
                10,
                vec![
                    Column::float64("x", (0..10).map(f64::from).collect()),
                    Column::float64("y", vec![9.0, 3.0, 7.0, 1.0, 5.0, 2.0, 8.0, 4.0, 6.0, 0.0]),
                    Column::categorical("group", groups),
                ],
            )
            .unwrap(),
        )
    }

    fn session() -> (ChartManager, DataStore) {
        let store = grouped_store();
        let charts = ChartManager::new();
        charts.add_data_source(store.clone()).unwrap();
        charts.add_chart("scatter", "cells", |_| {}).unwrap();
        (charts, store)
    }

    /// Poll until the store delivers a set of `expected` rows
    async fn settle_to(store: &DataStore, expected: usize) -> FilteredIndices {
        for _ in 0..400 {
            let delivered = store.get_filtered_indices().await;
            if delivered.len() == expected {
                return delivered;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("store never settled to {} rows", expected);
    }

    #[tokio::test]
    async fn test_range_and_category_conjunction() {
        let store = grouped_store();
        let r1 = store.add_dimension("R1");
        let r2 = store.add_dimension("R2");

        r1.filter(Predicate::range("x", 2.0, 5.0)).unwrap();
        r2.filter(Predicate::category("group", "A")).unwrap();

        let delivered = store.get_filtered_indices().await;
        assert_eq!(&delivered.indices()[..], &[3, 4]);
        assert_eq!(delivered.generation(), store.generation());
    }

    #[test]
    fn test_models_share_a_store_with_different_sorts() {
        let store = grouped_store();
        let by_y = DataModel::new(&store, ModelOptions::default());
        let by_x_desc = DataModel::new(&store, ModelOptions::default());
        by_y.sort("y", SortOrder::Ascending).unwrap();
        by_x_desc.sort("x", SortOrder::Descending).unwrap();

        let r1 = store.add_dimension("R1");
        let r2 = store.add_dimension("R2");
        r1.filter(Predicate::range("x", 2.0, 5.0)).unwrap();
        r2.filter(Predicate::category("group", "A")).unwrap();

        assert_eq!(&by_y.data()[..], &[3, 4]);
        assert_eq!(&by_x_desc.data()[..], &[4, 3]);
        assert_eq!(by_y.generation(), store.generation());
        assert_eq!(by_x_desc.generation(), store.generation());

        r2.filter(Predicate::category("group", "B")).unwrap();
        assert_eq!(&by_y.data()[..], &[5, 2]);
        assert_eq!(&by_x_desc.data()[..], &[5, 2]);

        r1.remove_filter().unwrap();
        assert_eq!(&by_y.data()[..], &[5, 1, 7, 2]);
        assert_eq!(&by_x_desc.data()[..], &[7, 5, 2, 1]);
    }

    #[tokio::test]
    async fn test_unknown_chart_pop_out_is_refused() {
        let (charts, _store) = session();
        let (link, mut peer) = PeerLink::pair();
        let bridge = SyncBridge::new(charts.clone(), link, SyncConfig::default());
        bridge.spawn();
        assert!(matches!(peer.recv().await, Some(SyncMessage::Hello { .. })));

        peer.send(SyncMessage::Popout {
            chart_id: "c7".to_string(),
            origin: None,
        })
        .unwrap();

        assert_eq!(
            peer.recv().await,
            Some(SyncMessage::PopoutFail {
                chart_id: "c7".to_string()
            })
        );
        assert_eq!(charts.chart_ids(), vec!["scatter"]);
        assert_eq!(charts.chart_state("scatter"), Some(PopoutState::Local));
        assert_eq!(bridge.mirror_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_pop_out_times_out_locally() {
        let (charts, _store) = session();
        let (link, _silent_peer) = PeerLink::pair();
        let bridge = SyncBridge::new(charts.clone(), link, SyncConfig::default());

        let started = tokio::time::Instant::now();
        let err = bridge.pop_out("scatter").await.unwrap_err();

        assert_eq!(
            err,
            RoutingError::Timeout {
                chart_id: "scatter".to_string(),
                timeout_ms: 5000
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(charts.chart_state("scatter"), Some(PopoutState::Local));
    }

    #[tokio::test]
    async fn test_sessions_converge_through_hub() {
        let hub = SyncHub::new();
        let (charts_a, store_a) = session();
        let (charts_b, store_b) = session();
        let bridge_a = SyncBridge::new(charts_a, hub.connect(), SyncConfig::default());
        let bridge_b = SyncBridge::new(charts_b, hub.connect(), SyncConfig::default());
        bridge_a.spawn();
        bridge_b.spawn();

        let x = store_a.add_dimension("x");
        x.filter(Predicate::range("x", 2.0, 5.0)).unwrap();
        assert_eq!(store_a.get_filtered_indices().await.len(), 4);

        let mirrored = settle_to(&store_b, 4).await;
        assert_eq!(&mirrored.indices()[..], &[2, 3, 4, 5]);
        assert!(mirrored.local_indices().len() == 10);
        assert_eq!(bridge_b.mirror_count(), 1);

        // Narrowing on B intersects with the mirrored filter
        let group = store_b.add_dimension("group");
        group.filter(Predicate::category("group", "A")).unwrap();
        assert_eq!(&store_b.get_filtered_indices().await.indices()[..], &[3, 4]);
        assert_eq!(&settle_to(&store_a, 2).await.indices()[..], &[3, 4]);

        // Clearing A's filter widens B back to its own filter
        x.remove_filter().unwrap();
        assert_eq!(store_a.get_filtered_indices().await.local_indices().len(), 10);
        let widened = settle_to(&store_b, 6).await;
        assert_eq!(&widened.indices()[..], &[0, 3, 4, 6, 8, 9]);
        assert_eq!(bridge_b.mirror_count(), 0);
    }

    #[tokio::test]
    async fn test_pop_out_over_hub_moves_chart() {
        let hub = SyncHub::new();
        let (charts_a, _store_a) = session();
        let (charts_b, _store_b) = session();
        let bridge_a = SyncBridge::new(charts_a.clone(), hub.connect(), SyncConfig::default());
        let bridge_b = SyncBridge::new(charts_b.clone(), hub.connect(), SyncConfig::default());
        bridge_a.spawn();
        bridge_b.spawn();

        bridge_a.pop_out("scatter").await.unwrap();

        assert_eq!(charts_a.chart_state("scatter"), Some(PopoutState::Confirmed));
        assert_eq!(charts_b.chart_state("scatter"), Some(PopoutState::Confirmed));
        let hosts: Vec<PeerSession> = hub
            .sessions()
            .into_iter()
            .filter(|session| session.charts.contains("scatter"))
            .collect();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].session_id.as_deref(), Some(bridge_b.session_id()));
    }

    fn host_of(hub: &SyncHub, chart_id: &str) -> Vec<Option<String>> {
        hub.sessions()
            .into_iter()
            .filter(|session| session.charts.contains(chart_id))
            .map(|session| session.session_id)
            .collect()
    }

    #[tokio::test]
    async fn test_refusing_session_does_not_beat_owner() {
        let hub = SyncHub::new();
        let (charts_a, _store_a) = session();
        let charts_c = ChartManager::new();
        charts_c.add_data_source(grouped_store()).unwrap();
        let (charts_b, _store_b) = session();
        let bridge_a = SyncBridge::new(charts_a.clone(), hub.connect(), SyncConfig::default());
        let bridge_c = SyncBridge::new(charts_c.clone(), hub.connect(), SyncConfig::default());
        let bridge_b = SyncBridge::new(charts_b.clone(), hub.connect(), SyncConfig::default());
        bridge_a.spawn();
        bridge_c.spawn();
        bridge_b.spawn();

        assert_eq!(bridge_a.pop_out("scatter").await, Ok(()));

        assert_eq!(charts_a.chart_state("scatter"), Some(PopoutState::Confirmed));
        assert_eq!(charts_b.chart_state("scatter"), Some(PopoutState::Confirmed));
        assert!(charts_c.chart_ids().is_empty());
        assert_eq!(
            host_of(&hub, "scatter"),
            vec![Some(bridge_b.session_id().to_string())]
        );
        assert_eq!(
            bridge_a.chart_host("scatter").as_deref(),
            Some(bridge_b.session_id())
        );
        assert_eq!(hub.pending_popouts(), 0);
    }

    #[tokio::test]
    async fn test_one_of_two_owners_hosts_the_chart() {
        let hub = SyncHub::new();
        let (charts_a, _store_a) = session();
        let (charts_b, _store_b) = session();
        let (charts_c, _store_c) = session();
        let bridge_a = SyncBridge::new(charts_a.clone(), hub.connect(), SyncConfig::default());
        let bridge_b = SyncBridge::new(charts_b.clone(), hub.connect(), SyncConfig::default());
        let bridge_c = SyncBridge::new(charts_c.clone(), hub.connect(), SyncConfig::default());
        bridge_a.spawn();
        bridge_b.spawn();
        bridge_c.spawn();

        bridge_a.pop_out("scatter").await.unwrap();
        let host = bridge_a.chart_host("scatter").unwrap();
        let (winner, loser) = if host == bridge_b.session_id() {
            (&charts_b, &charts_c)
        } else {
            assert_eq!(host, bridge_c.session_id());
            (&charts_c, &charts_b)
        };

        assert_eq!(winner.chart_state("scatter"), Some(PopoutState::Confirmed));
        for _ in 0..400 {
            if loser.chart_state("scatter") == Some(PopoutState::Local) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(loser.chart_state("scatter"), Some(PopoutState::Local));
        assert_eq!(host_of(&hub, "scatter"), vec![Some(host)]);
    }

    #[tokio::test]
    async fn test_chart_returns_when_host_leaves() {
        let hub = SyncHub::new();
        let (charts_a, _store_a) = session();
        let (charts_b, _store_b) = session();
        let bridge_a = SyncBridge::new(charts_a.clone(), hub.connect(), SyncConfig::default());
        let bridge_b = SyncBridge::new(charts_b, hub.connect(), SyncConfig::default());
        bridge_a.spawn();
        let task_b = bridge_b.spawn();

        bridge_a.pop_out("scatter").await.unwrap();
        assert_eq!(charts_a.chart_state("scatter"), Some(PopoutState::Confirmed));

        task_b.abort();
        let _ = task_b.await;
        drop(bridge_b);

        for _ in 0..400 {
            if charts_a.chart_state("scatter") == Some(PopoutState::Local) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(charts_a.chart_state("scatter"), Some(PopoutState::Local));
        assert_eq!(bridge_a.chart_host("scatter"), None);
        assert_eq!(hub.len(), 1);
    }

    const GROUPS: [&str; 3] = ["A", "B", "C"];

    /// A filter shape with a row-by-row reference evaluation
    #[derive(Debug, Clone)]
    enum Shape {
        Range { column: usize, min: f64, max: f64 },
        Rectangle { x: (f64, f64), y: (f64, f64) },
        Lasso(Vec<[f64; 2]>),
        Groups(Vec<&'static str>),
    }

    impl Shape {
        fn predicate(&self) -> Predicate {
            match self {
                Shape::Range { column, min, max } => {
                    Predicate::range(["x", "y"][*column], *min, *max)
                }
                Shape::Rectangle { x, y } => Predicate::rectangle("x", "y", *x, *y),
                Shape::Lasso(ring) => Predicate::polygon("x", "y", ring.clone()),
                Shape::Groups(groups) => Predicate::categories("group", groups.iter().copied()),
            }
        }

        fn matches(&self, x: f64, y: f64, group: &str) -> bool {
            match self {
                Shape::Range { column, min, max } => {
                    let v = [x, y][*column];
                    v >= *min && v <= *max
                }
                Shape::Rectangle { x: xr, y: yr } => {
                    x >= xr.0 && x <= xr.1 && y >= yr.0 && y <= yr.1
                }
                Shape::Lasso(ring) => {
                    let mut inside = false;
                    for i in 0..ring.len() {
                        let [ax, ay] = ring[i];
                        let [bx, by] = ring[(i + 1) % ring.len()];
                        if (ay > y) != (by > y) && x < (bx - ax) * (y - ay) / (by - ay) + ax {
                            inside = !inside;
                        }
                    }
                    inside
                }
                Shape::Groups(groups) => groups.contains(&group),
            }
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(usize, Shape),
        Remove(usize),
        Unregister(usize),
        Register(usize),
    }

    fn ordered() -> impl Strategy<Value = (f64, f64)> {
        (0.0f64..100.0, 0.0f64..100.0).prop_map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
    }

    fn shape() -> impl Strategy<Value = Shape> {
        prop_oneof![
            (0usize..2, ordered()).prop_map(|(column, (min, max))| Shape::Range { column, min, max }),
            (ordered(), ordered()).prop_map(|(x, y)| Shape::Rectangle { x, y }),
            prop::collection::vec((0.0f64..100.0, 0.0f64..100.0), 3..7)
                .prop_map(|ring| Shape::Lasso(ring.into_iter().map(|(x, y)| [x, y]).collect())),
            prop::sample::subsequence(GROUPS.to_vec(), 0..=3).prop_map(Shape::Groups),
        ]
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0usize..4, shape()).prop_map(|(dim, shape)| Op::Set(dim, shape)),
            1 => (0usize..4).prop_map(Op::Remove),
            1 => (0usize..4).prop_map(Op::Unregister),
            1 => (0usize..4).prop_map(Op::Register),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_delivered_set_matches_row_by_row_evaluation(
            rows in prop::collection::vec((0.0f64..100.0, 0.0f64..100.0, 0usize..3), 0..64),
            ops in prop::collection::vec(op(), 1..24),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let store = DataStore::new(
                    ColumnStore::new(
                        "props",
                        rows.len(),
                        vec![
                            Column::float64("x", rows.iter().map(|r| r.0).collect()),
                            Column::float64("y", rows.iter().map(|r| r.1).collect()),
                            Column::categorical("group", rows.iter().map(|r| GROUPS[r.2])),
                        ],
                    )
                    .unwrap(),
                );
                let dimensions: Vec<Dimension> =
                    (0..4).map(|i| store.add_dimension(format!("d{}", i))).collect();
                let mut registered = [true; 4];
                let mut active: [Option<Shape>; 4] = Default::default();

                for op in ops {
                    match op {
                        Op::Set(dim, shape) => {
                            let result = dimensions[dim].filter(shape.predicate());
                            prop_assert_eq!(result.is_ok(), registered[dim]);
                            if registered[dim] {
                                active[dim] = Some(shape);
                            }
                        }
                        Op::Remove(dim) => {
                            let result = dimensions[dim].remove_filter();
                            prop_assert_eq!(result.is_ok(), registered[dim]);
                            active[dim] = None;
                        }
                        Op::Unregister(dim) => {
                            let result = store.unregister_dimension(&dimensions[dim]);
                            prop_assert_eq!(result.is_ok(), registered[dim]);
                            registered[dim] = false;
                            active[dim] = None;
                        }
                        Op::Register(dim) => {
                            store.register_dimension(&dimensions[dim]).unwrap();
                            registered[dim] = true;
                        }
                    }

                    let expected: Vec<RowIndex> = rows
                        .iter()
                        .enumerate()
                        .filter(|(_, (x, y, g))| {
                            active
                                .iter()
                                .flatten()
                                .all(|shape| shape.matches(*x, *y, GROUPS[*g]))
                        })
                        .map(|(row, _)| row as RowIndex)
                        .collect();
                    let delivered = store.get_filtered_indices().await;
                    prop_assert_eq!(delivered.generation(), store.generation());
                    prop_assert_eq!(delivered.indices().to_vec(), expected);
                }
                Ok::<(), proptest::test_runner::TestCaseError>(())
            })?;
        }
    }
}
