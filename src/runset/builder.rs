//! Run-set construction: allocation, wiring and command order.
//!
//! Every producer of a connector type is wired to every consumer of that
//! type. The command order of a member is 0 when it feeds nothing, else one
//! more than the highest order among the members it feeds. Back-edge types
//! and optional outputs do not contribute to ordering. Commands that bring
//! a run up go in ascending order, so consumers are listening before their
//! producers start; shutdown goes in descending order.

use crate::component::{ComponentId, ComponentSpec, RegisteredComponent, WiringEntry};
use crate::error::{CncError, CncResult};
use crate::registry::ComponentRegistry;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// One consumer a producer's connector is wired to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WiringTarget {
    pub consumer: ComponentId,
    pub entry: WiringEntry,
}

/// All consumers of one producer connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WiringEdge {
    pub producer: ComponentId,
    pub conn_type: String,
    pub optional: bool,
    pub targets: Vec<WiringTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WiringPlan {
    edges: Vec<WiringEdge>,
}

impl WiringPlan {
    pub fn edges(&self) -> &[WiringEdge] {
        &self.edges
    }

    /// Connections `producer` must open, in wiring order.
    pub fn entries_for(&self, producer: ComponentId) -> Vec<WiringEntry> {
        self.edges
            .iter()
            .filter(|e| e.producer == producer)
            .flat_map(|e| e.targets.iter().map(|t| t.entry.clone()))
            .collect()
    }
}

/// Members in command order plus their wiring.
#[derive(Debug)]
pub struct BuiltRunSet {
    pub members: Vec<RegisteredComponent>,
    pub plan: WiringPlan,
    /// Requested components left out by a lenient build.
    pub missing: Vec<String>,
}

pub struct RunSetBuilder<'a> {
    registry: &'a ComponentRegistry,
    back_edges: HashSet<String>,
}

impl<'a> RunSetBuilder<'a> {
    pub fn new(registry: &'a ComponentRegistry, back_edges: &[String]) -> Self {
        Self {
            registry,
            back_edges: back_edges.iter().cloned().collect(),
        }
    }

    /// Allocates `specs`, wires them and orders them. On any failure after
    /// allocation the components go straight back to the registry.
    pub fn build(&self, specs: &[ComponentSpec], strict: bool) -> CncResult<BuiltRunSet> {
        if specs.is_empty() {
            return Err(CncError::NoComponents);
        }
        let allocation = self.registry.allocate(specs, strict)?;
        if !allocation.missing.is_empty() {
            warn!(
                "Building run set without {}",
                allocation.missing.join(", ")
            );
        }

        let mut members = allocation.components;
        let planned = wire(&members).and_then(|plan| {
            assign_order(&mut members, &plan, &self.back_edges)?;
            Ok(plan)
        });
        match planned {
            Ok(plan) => {
                sort_members(&mut members);
                Ok(BuiltRunSet {
                    members,
                    plan,
                    missing: allocation.missing,
                })
            }
            Err(e) => {
                self.registry.return_components(members);
                Err(e)
            }
        }
    }
}

/// Matches producers to consumers by connector type.
pub fn wire(members: &[RegisteredComponent]) -> CncResult<WiringPlan> {
    struct Side<'m> {
        member: &'m RegisteredComponent,
        optional: bool,
        port: Option<u16>,
    }

    let mut producers: BTreeMap<&str, Vec<Side<'_>>> = BTreeMap::new();
    let mut consumers: BTreeMap<&str, Vec<Side<'_>>> = BTreeMap::new();
    for member in members {
        for conn in &member.descriptor().connectors {
            let side = Side {
                member,
                optional: conn.direction.is_optional(),
                port: conn.port,
            };
            if conn.direction.is_input() {
                consumers.entry(conn.conn_type.as_str()).or_default().push(side);
            } else {
                producers.entry(conn.conn_type.as_str()).or_default().push(side);
            }
        }
    }

    let mut unresolved = Vec::new();
    for (conn_type, sides) in &consumers {
        if !producers.contains_key(conn_type) {
            for side in sides.iter().filter(|s| !s.optional) {
                unresolved.push(format!(
                    "{} input '{}' has no producer",
                    side.member.descriptor().full_name(),
                    conn_type
                ));
            }
        }
    }
    for (conn_type, sides) in &producers {
        if !consumers.contains_key(conn_type) {
            for side in sides.iter().filter(|s| !s.optional) {
                unresolved.push(format!(
                    "{} output '{}' has no consumer",
                    side.member.descriptor().full_name(),
                    conn_type
                ));
            }
        }
    }
    if !unresolved.is_empty() {
        return Err(CncError::UnresolvedConnectors(unresolved));
    }

    let mut edges = Vec::new();
    for (conn_type, sides) in &producers {
        let Some(targets) = consumers.get(conn_type) else {
            continue;
        };
        for producer in sides {
            let targets: Vec<WiringTarget> = targets
                .iter()
                .filter(|t| t.member.id() != producer.member.id())
                .map(|t| {
                    let d = t.member.descriptor();
                    WiringTarget {
                        consumer: d.id,
                        entry: WiringEntry {
                            conn_type: conn_type.to_string(),
                            host: d.host.clone(),
                            port: t.port.unwrap_or_default(),
                            name: d.name.clone(),
                            num: d.num,
                        },
                    }
                })
                .collect();
            if targets.is_empty() {
                continue;
            }
            edges.push(WiringEdge {
                producer: producer.member.id(),
                conn_type: conn_type.to_string(),
                optional: producer.optional,
                targets,
            });
        }
    }
    Ok(WiringPlan { edges })
}

/// Computes and stores each member's command order.
pub fn assign_order(
    members: &mut [RegisteredComponent],
    plan: &WiringPlan,
    back_edges: &HashSet<String>,
) -> CncResult<()> {
    let mut downstream: HashMap<ComponentId, Vec<ComponentId>> = HashMap::new();
    for edge in plan.edges() {
        if edge.optional || back_edges.contains(&edge.conn_type) {
            continue;
        }
        let next = downstream.entry(edge.producer).or_default();
        for target in &edge.targets {
            if !next.contains(&target.consumer) {
                next.push(target.consumer);
            }
        }
    }

    let names: HashMap<ComponentId, String> = members
        .iter()
        .map(|m| (m.id(), m.descriptor().full_name()))
        .collect();
    let mut orders: HashMap<ComponentId, u32> = HashMap::new();
    let mut ids: Vec<ComponentId> = members.iter().map(RegisteredComponent::id).collect();
    ids.sort();
    for id in ids {
        let mut path = Vec::new();
        order_of(id, &downstream, &mut orders, &mut path, &names)?;
    }

    for member in members.iter_mut() {
        member.set_order(orders.get(&member.id()).copied().unwrap_or(0));
    }
    Ok(())
}

fn order_of(
    id: ComponentId,
    downstream: &HashMap<ComponentId, Vec<ComponentId>>,
    orders: &mut HashMap<ComponentId, u32>,
    path: &mut Vec<ComponentId>,
    names: &HashMap<ComponentId, String>,
) -> CncResult<u32> {
    if let Some(order) = orders.get(&id) {
        return Ok(*order);
    }
    if let Some(start) = path.iter().position(|p| *p == id) {
        let cycle = path[start..]
            .iter()
            .chain(std::iter::once(&id))
            .map(|p| names.get(p).cloned().unwrap_or_else(|| p.to_string()))
            .collect();
        return Err(CncError::CyclicWiring(cycle));
    }

    path.push(id);
    let mut order = 0;
    if let Some(next) = downstream.get(&id) {
        for consumer in next {
            order = order.max(order_of(*consumer, downstream, orders, path, names)? + 1);
        }
    }
    path.pop();
    orders.insert(id, order);
    Ok(order)
}

/// Ascending order; ties broken by name, then instance number.
pub fn sort_members(members: &mut [RegisteredComponent]) {
    members.sort_by(|a, b| {
        let (da, db) = (a.descriptor(), b.descriptor());
        a.order()
            .cmp(&b.order())
            .then_with(|| da.name.cmp(&db.name))
            .then_with(|| da.num.cmp(&db.num))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::mock::{MockBus, MockComponent};
    use crate::component::Connector;
    use std::sync::Arc;

    fn register(registry: &ComponentRegistry, name: &str, num: u32, connectors: Vec<Connector>) {
        let mock = MockComponent::new(name, num, connectors, MockBus::new())
            .with_address("localhost", 6000 + num as u16);
        registry
            .register(mock.registration(), Arc::new(mock))
            .unwrap();
    }

    fn standard(registry: &ComponentRegistry) {
        register(
            registry,
            "stringHub",
            1,
            vec![
                Connector::output("stringHit"),
                Connector::input("rdoutReq", 7001),
                Connector::output("rdoutData"),
            ],
        );
        register(
            registry,
            "stringHub",
            2,
            vec![
                Connector::output("stringHit"),
                Connector::input("rdoutReq", 7002),
                Connector::output("rdoutData"),
            ],
        );
        register(
            registry,
            "inIceTrigger",
            0,
            vec![Connector::input("stringHit", 7100), Connector::output("trigger")],
        );
        register(
            registry,
            "eventBuilder",
            0,
            vec![
                Connector::input("trigger", 7200),
                Connector::output("rdoutReq"),
                Connector::input("rdoutData", 7201),
            ],
        );
    }

    fn specs(names: &[&str]) -> Vec<ComponentSpec> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn test_standard_chain_order() {
        let registry = ComponentRegistry::new();
        standard(&registry);
        let built = RunSetBuilder::new(&registry, &["rdoutReq".to_string()])
            .build(
                &specs(&["stringHub#1", "stringHub#2", "inIceTrigger", "eventBuilder"]),
                true,
            )
            .unwrap();

        let order: Vec<(String, u32)> = built
            .members
            .iter()
            .map(|m| (m.descriptor().full_name(), m.order()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("eventBuilder".to_string(), 0),
                ("inIceTrigger".to_string(), 1),
                ("stringHub#1".to_string(), 2),
                ("stringHub#2".to_string(), 2),
            ]
        );

        // The builder requests readouts from both hubs.
        let builder = built.members[0].id();
        let requests = built.plan.entries_for(builder);
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|e| e.conn_type == "rdoutReq"));
        assert_eq!(requests[0].port, 7001);
    }

    #[test]
    fn test_missing_consumer_is_unresolved() {
        let registry = ComponentRegistry::new();
        standard(&registry);
        let err = RunSetBuilder::new(&registry, &[])
            .build(&specs(&["stringHub#1", "eventBuilder"]), true)
            .unwrap_err();
        match err {
            CncError::UnresolvedConnectors(list) => {
                assert!(list.iter().any(|l| l.contains("stringHit")));
                assert!(list.iter().any(|l| l.contains("trigger")));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Everything went back to the registry.
        assert_eq!(registry.list().len(), 4);
    }

    #[test]
    fn test_optional_connectors_may_dangle() {
        let registry = ComponentRegistry::new();
        register(
            &registry,
            "hub",
            1,
            vec![Connector::output("hit"), Connector::optional_output("moni")],
        );
        register(
            &registry,
            "builder",
            0,
            vec![
                Connector::input("hit", 7000),
                Connector::optional_input("tcal", 7001),
            ],
        );
        let built = RunSetBuilder::new(&registry, &[])
            .build(&specs(&["hub#1", "builder"]), true)
            .unwrap();
        assert_eq!(built.plan.edges().len(), 1);
    }

    #[test]
    fn test_cycle_is_reported() {
        let registry = ComponentRegistry::new();
        register(
            &registry,
            "alphaTrigger",
            0,
            vec![Connector::output("a"), Connector::input("b", 7000)],
        );
        register(
            &registry,
            "betaTrigger",
            0,
            vec![Connector::output("b"), Connector::input("a", 7001)],
        );
        let err = RunSetBuilder::new(&registry, &[])
            .build(&specs(&["alphaTrigger", "betaTrigger"]), true)
            .unwrap_err();
        match err {
            CncError::CyclicWiring(path) => {
                assert!(path.contains(&"alphaTrigger".to_string()));
                assert!(path.contains(&"betaTrigger".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.census().allocated, 0);
    }

    #[test]
    fn test_back_edge_breaks_cycle() {
        let registry = ComponentRegistry::new();
        register(
            &registry,
            "alphaTrigger",
            0,
            vec![Connector::output("a"), Connector::input("b", 7000)],
        );
        register(
            &registry,
            "betaTrigger",
            0,
            vec![Connector::output("b"), Connector::input("a", 7001)],
        );
        let built = RunSetBuilder::new(&registry, &["b".to_string()])
            .build(&specs(&["alphaTrigger", "betaTrigger"]), true)
            .unwrap();
        assert_eq!(built.members[0].descriptor().name, "betaTrigger");
        assert_eq!(built.members[1].order(), 1);
    }

    #[test]
    fn test_empty_request() {
        let registry = ComponentRegistry::new();
        let err = RunSetBuilder::new(&registry, &[]).build(&[], true).unwrap_err();
        assert!(matches!(err, CncError::NoComponents));
    }
}
