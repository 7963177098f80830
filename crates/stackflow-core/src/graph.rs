//! 依存グラフ
//!
//! デプロイメント宣言から「先に存在している必要がある」関係の有向非巡回グラフを構築します。
//! 辺は次の3種類から導出されます。
//!
//! 1. リソースの明示的な `depends_on`
//! 2. 設定値に埋め込まれた出力参照（暗黙の依存）
//! 3. スタック間の `depends_on`（下流スタックの各リソースは上流スタックの全リソースに依存）
//!
//! 順序付けの前に必ず循環検出を行い、循環があれば部分的なグラフは返しません。
//! トポロジカル順序はアドレス順をタイブレークに使うため、同じ入力に対して常に同じ順序になります。

use crate::error::{ConfigError, Result};
use crate::model::{Deployment, ResourceAddress, ResourceDescriptor, StackDescriptor, StackId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use tracing::{debug, instrument};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// 三色DFSで循環を探す
///
/// 見つかった場合は循環を構成するノード列（先頭ノードを末尾に繰り返す）を返します。
/// マップに存在しないノードへの辺は無視します。
pub fn find_cycle<K: Ord + Clone>(deps: &BTreeMap<K, BTreeSet<K>>) -> Option<Vec<K>> {
    fn visit<K: Ord + Clone>(
        node: &K,
        deps: &BTreeMap<K, BTreeSet<K>>,
        colors: &mut BTreeMap<K, Color>,
        path: &mut Vec<K>,
    ) -> Option<Vec<K>> {
        colors.insert(node.clone(), Color::Gray);
        path.push(node.clone());

        if let Some(targets) = deps.get(node) {
            for next in targets {
                match colors.get(next).copied() {
                    None => continue,
                    Some(Color::Gray) => {
                        let start = path.iter().position(|n| n == next).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(next.clone());
                        return Some(cycle);
                    }
                    Some(Color::White) => {
                        if let Some(cycle) = visit(next, deps, colors, path) {
                            return Some(cycle);
                        }
                    }
                    Some(Color::Black) => {}
                }
            }
        }

        path.pop();
        colors.insert(node.clone(), Color::Black);
        None
    }

    let mut colors: BTreeMap<K, Color> = deps.keys().map(|k| (k.clone(), Color::White)).collect();
    let mut path = Vec::new();
    for node in deps.keys() {
        if colors.get(node) == Some(&Color::White)
            && let Some(cycle) = visit(node, deps, &mut colors, &mut path)
        {
            return Some(cycle);
        }
    }
    None
}

/// 決定的なトポロジカルソート（依存先が先）
///
/// `deps` は「ノード → そのノードが依存するノード集合」です。
/// 同時に処理可能なノードはキー順に並びます。
pub fn toposort<K: Ord + Clone + Display>(deps: &BTreeMap<K, BTreeSet<K>>) -> Result<Vec<K>> {
    if let Some(cycle) = find_cycle(deps) {
        return Err(ConfigError::CyclicDependency {
            cycle: cycle.iter().map(|k| k.to_string()).collect(),
        });
    }

    let mut remaining: BTreeMap<&K, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&K, Vec<&K>> = BTreeMap::new();
    for (node, targets) in deps {
        let present: Vec<&K> = targets.iter().filter(|t| deps.contains_key(*t)).collect();
        remaining.insert(node, present.len());
        for target in present {
            dependents.entry(target).or_default().push(node);
        }
    }

    let mut ready: BTreeSet<&K> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut order = Vec::with_capacity(deps.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.clone());
        if let Some(children) = dependents.get(node) {
            for child in children {
                if let Some(count) = remaining.get_mut(*child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
    }

    Ok(order)
}

/// リソース依存グラフ
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<ResourceAddress, ResourceDescriptor>,
    dependencies: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
    dependents: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
    stack_dependencies: BTreeMap<StackId, BTreeSet<StackId>>,
    order: Vec<ResourceAddress>,
}

impl DependencyGraph {
    /// 単一スタックからグラフを構築
    pub fn from_stack(stack: &StackDescriptor) -> Result<Self> {
        let mut deployment = Deployment::new(stack.id.clone());
        deployment.add_stack(stack.clone())?;
        Self::build(&deployment)
    }

    /// デプロイメント全体からグラフを構築
    #[instrument(skip(deployment), fields(deployment = %deployment.name))]
    pub fn build(deployment: &Deployment) -> Result<Self> {
        // 1. スタック間の依存
        let mut stack_dependencies: BTreeMap<StackId, BTreeSet<StackId>> = BTreeMap::new();
        for stack in &deployment.stacks {
            if stack_dependencies
                .insert(stack.id.clone(), stack.depends_on.clone())
                .is_some()
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "スタック '{}' が重複しています",
                    stack.id
                )));
            }
        }
        for (stack, deps) in &stack_dependencies {
            for dep in deps {
                if !stack_dependencies.contains_key(dep) {
                    return Err(ConfigError::UnknownStack(format!(
                        "{} (スタック '{}' の depends-on)",
                        dep, stack
                    )));
                }
            }
        }
        if let Some(cycle) = find_cycle(&stack_dependencies) {
            return Err(ConfigError::CyclicDependency { cycle });
        }
        let upstream = upstream_closure(&stack_dependencies);

        // 2. ノード
        let mut nodes = BTreeMap::new();
        for resource in deployment.resources() {
            let address = resource.address().clone();
            if !stack_dependencies.contains_key(&address.stack) {
                return Err(ConfigError::UnknownStack(address.stack.clone()));
            }
            if nodes.insert(address.clone(), resource.clone()).is_some() {
                return Err(ConfigError::DuplicateResource(address.to_string()));
            }
        }

        // 3. 辺
        let mut dependencies: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>> =
            nodes.keys().map(|a| (a.clone(), BTreeSet::new())).collect();

        for (address, resource) in &nodes {
            let mut edges = BTreeSet::new();

            for target in resource.depends_on() {
                if !nodes.contains_key(target) {
                    return Err(ConfigError::UndeclaredDependency {
                        from: address.to_string(),
                        to: target.to_string(),
                        message: "依存先リソースが宣言されていません".to_string(),
                    });
                }
                check_stack_scope(address, target, &upstream)?;
                edges.insert(target.clone());
            }

            for reference in resource.references() {
                let target = nodes.get(&reference.target).ok_or_else(|| {
                    ConfigError::UnresolvedReference {
                        reference: reference.to_string(),
                        message: format!(
                            "{} が参照しているリソースが宣言されていません",
                            address
                        ),
                    }
                })?;
                if !target.kind().has_output(&reference.attribute) {
                    return Err(ConfigError::UnresolvedReference {
                        reference: reference.to_string(),
                        message: format!(
                            "{} は出力属性 '{}' を持ちません（利用可能: {}）",
                            target.kind(),
                            reference.attribute,
                            target.kind().schema().outputs.join(", ")
                        ),
                    });
                }
                check_stack_scope(address, &reference.target, &upstream)?;
                edges.insert(reference.target.clone());
            }

            if let Some(stack_deps) = stack_dependencies.get(&address.stack) {
                for upstream_stack in stack_deps {
                    edges.extend(
                        nodes
                            .keys()
                            .filter(|a| &a.stack == upstream_stack)
                            .cloned(),
                    );
                }
            }

            dependencies.insert(address.clone(), edges);
        }

        // 4. 循環検出 → 順序付け
        let order = toposort(&dependencies)?;

        let mut dependents: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>> =
            nodes.keys().map(|a| (a.clone(), BTreeSet::new())).collect();
        for (node, targets) in &dependencies {
            for target in targets {
                if let Some(set) = dependents.get_mut(target) {
                    set.insert(node.clone());
                }
            }
        }

        debug!(
            resources = nodes.len(),
            stacks = stack_dependencies.len(),
            "Dependency graph built"
        );

        Ok(Self {
            nodes,
            dependencies,
            dependents,
            stack_dependencies,
            order,
        })
    }

    /// トポロジカル順序（依存先が先）
    pub fn topological_order(&self) -> &[ResourceAddress] {
        &self.order
    }

    /// 逆トポロジカル順序（依存元が先）
    pub fn reverse_topological_order(&self) -> Vec<ResourceAddress> {
        self.order.iter().rev().cloned().collect()
    }

    /// トポロジカル順のリソース宣言
    pub fn descriptors(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.order.iter().filter_map(|a| self.nodes.get(a))
    }

    pub fn descriptor(&self, address: &ResourceAddress) -> Option<&ResourceDescriptor> {
        self.nodes.get(address)
    }

    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.nodes.contains_key(address)
    }

    /// 直接の依存先
    pub fn dependencies(
        &self,
        address: &ResourceAddress,
    ) -> impl Iterator<Item = &ResourceAddress> {
        self.dependencies.get(address).into_iter().flatten()
    }

    /// 直接の依存元
    pub fn dependents(&self, address: &ResourceAddress) -> impl Iterator<Item = &ResourceAddress> {
        self.dependents.get(address).into_iter().flatten()
    }

    /// 推移的な依存元
    pub fn transitive_dependents(&self, address: &ResourceAddress) -> BTreeSet<ResourceAddress> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&ResourceAddress> = self.dependents(address).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    /// スタック間の依存
    pub fn stack_dependencies(&self) -> &BTreeMap<StackId, BTreeSet<StackId>> {
        &self.stack_dependencies
    }

    /// 指定スタックに（推移的に）依存しているスタック
    pub fn downstream_stacks(&self, stack: &str) -> BTreeSet<StackId> {
        let upstream = upstream_closure(&self.stack_dependencies);
        upstream
            .into_iter()
            .filter(|(_, ups)| ups.contains(stack))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// 各スタックが（推移的に）依存するスタック集合
fn upstream_closure(
    stack_dependencies: &BTreeMap<StackId, BTreeSet<StackId>>,
) -> BTreeMap<StackId, BTreeSet<StackId>> {
    let mut closure = BTreeMap::new();
    for stack in stack_dependencies.keys() {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<&StackId> = stack_dependencies[stack].iter().collect();
        while let Some(next) = pending.pop() {
            if seen.insert(next.clone())
                && let Some(deps) = stack_dependencies.get(next)
            {
                pending.extend(deps);
            }
        }
        closure.insert(stack.clone(), seen);
    }
    closure
}

/// 参照先が同じスタックか上流スタックにあることを確認
fn check_stack_scope(
    from: &ResourceAddress,
    to: &ResourceAddress,
    upstream: &BTreeMap<StackId, BTreeSet<StackId>>,
) -> Result<()> {
    if from.stack == to.stack {
        return Ok(());
    }
    let reachable = upstream
        .get(&from.stack)
        .is_some_and(|ups| ups.contains(&to.stack));
    if reachable {
        Ok(())
    } else {
        Err(ConfigError::UndeclaredDependency {
            from: from.to_string(),
            to: to.to_string(),
            message: format!(
                "スタック '{}' は '{}' に依存していません。stack \"{}\" に depends-on \"{}\" を追加してください",
                from.stack, to.stack, from.stack, to.stack
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConfigValue, ResourceConfig, ResourceKind};

    fn resource(
        stack: &str,
        name: &str,
        kind: ResourceKind,
        config: ResourceConfig,
        deps: &[&str],
    ) -> ResourceDescriptor {
        ResourceDescriptor::with_kind(
            ResourceAddress::new(stack, name),
            kind,
            config,
            deps.iter().map(|d| ResourceAddress::new(stack, *d)).collect(),
        )
    }

    fn scenario_stack() -> StackDescriptor {
        let mut stack = StackDescriptor::new("mlflow");
        let resources: [(&str, ResourceKind, &[&str]); 4] = [
            ("svc", ResourceKind::Service, &["db", "store"]),
            ("db", ResourceKind::Database, &["store"]),
            ("net", ResourceKind::Network, &[]),
            ("store", ResourceKind::Bucket, &["net"]),
        ];
        for (name, kind, deps) in resources {
            stack
                .add_resource(resource("mlflow", name, kind, ResourceConfig::new(), deps))
                .unwrap();
        }
        stack
    }

    fn names(order: &[ResourceAddress]) -> Vec<&str> {
        order.iter().map(|a| a.resource.as_str()).collect()
    }

    #[test]
    fn test_scenario_order() {
        let graph = DependencyGraph::from_stack(&scenario_stack()).unwrap();
        assert_eq!(names(graph.topological_order()), vec!["net", "store", "db", "svc"]);
        assert_eq!(
            names(&graph.reverse_topological_order()),
            vec!["svc", "db", "store", "net"]
        );
    }

    #[test]
    fn test_order_is_deterministic_permutation() {
        let stack = scenario_stack();
        let first = DependencyGraph::from_stack(&stack).unwrap();

        let mut reversed = stack.clone();
        reversed.resources.reverse();
        let second = DependencyGraph::from_stack(&reversed).unwrap();

        assert_eq!(first.topological_order(), second.topological_order());

        let mut sorted: Vec<_> = first.topological_order().to_vec();
        sorted.sort();
        let mut declared: Vec<_> = stack.resources.iter().map(|r| r.address().clone()).collect();
        declared.sort();
        assert_eq!(sorted, declared);
    }

    #[test]
    fn test_tie_break_by_address() {
        let mut stack = StackDescriptor::new("s");
        for name in ["c", "a", "b"] {
            stack
                .add_resource(resource("s", name, ResourceKind::Bucket, ResourceConfig::new(), &[]))
                .unwrap();
        }
        let graph = DependencyGraph::from_stack(&stack).unwrap();
        assert_eq!(names(graph.topological_order()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_is_named() {
        let mut stack = StackDescriptor::new("s");
        stack
            .add_resource(resource("s", "a", ResourceKind::Network, ResourceConfig::new(), &["c"]))
            .unwrap();
        stack
            .add_resource(resource("s", "b", ResourceKind::Bucket, ResourceConfig::new(), &["a"]))
            .unwrap();
        stack
            .add_resource(resource("s", "c", ResourceKind::Database, ResourceConfig::new(), &["b"]))
            .unwrap();

        let err = DependencyGraph::from_stack(&stack).unwrap_err();
        match err {
            ConfigError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["s.a", "s.c", "s.b", "s.a"]);
            }
            other => panic!("Expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let mut stack = StackDescriptor::new("s");
        stack
            .add_resource(resource("s", "a", ResourceKind::Network, ResourceConfig::new(), &["a"]))
            .unwrap();
        assert!(matches!(
            DependencyGraph::from_stack(&stack),
            Err(ConfigError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_reference_adds_implicit_edge() {
        let mut stack = StackDescriptor::new("s");
        stack
            .add_resource(resource("s", "vpc", ResourceKind::Network, ResourceConfig::new(), &[]))
            .unwrap();
        let config = ResourceConfig::from([(
            "vpc".to_string(),
            ConfigValue::reference(ResourceAddress::new("s", "vpc"), "vpc_id"),
        )]);
        stack
            .add_resource(resource("s", "cluster", ResourceKind::Cluster, config, &[]))
            .unwrap();

        let graph = DependencyGraph::from_stack(&stack).unwrap();
        let cluster = ResourceAddress::new("s", "cluster");
        let deps: Vec<_> = graph.dependencies(&cluster).collect();
        assert_eq!(deps, vec![&ResourceAddress::new("s", "vpc")]);
        assert_eq!(names(graph.topological_order()), vec!["vpc", "cluster"]);
    }

    #[test]
    fn test_reference_to_missing_resource() {
        let mut stack = StackDescriptor::new("s");
        let config = ResourceConfig::from([(
            "vpc".to_string(),
            ConfigValue::reference(ResourceAddress::new("s", "ghost"), "vpc_id"),
        )]);
        stack
            .add_resource(resource("s", "cluster", ResourceKind::Cluster, config, &[]))
            .unwrap();
        assert!(matches!(
            DependencyGraph::from_stack(&stack),
            Err(ConfigError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_reference_to_unknown_attribute() {
        let mut stack = StackDescriptor::new("s");
        stack
            .add_resource(resource("s", "vpc", ResourceKind::Network, ResourceConfig::new(), &[]))
            .unwrap();
        let config = ResourceConfig::from([(
            "vpc".to_string(),
            ConfigValue::reference(ResourceAddress::new("s", "vpc"), "password"),
        )]);
        stack
            .add_resource(resource("s", "cluster", ResourceKind::Cluster, config, &[]))
            .unwrap();
        assert!(matches!(
            DependencyGraph::from_stack(&stack),
            Err(ConfigError::UnresolvedReference { .. })
        ));
    }

    fn two_stacks(declare_dependency: bool) -> Deployment {
        let mut network = StackDescriptor::new("network");
        network
            .add_resource(resource(
                "network",
                "vpc",
                ResourceKind::Network,
                ResourceConfig::new(),
                &[],
            ))
            .unwrap();

        let mut db = StackDescriptor::new("db");
        if declare_dependency {
            db = db.with_dependency("network");
        }
        let config = ResourceConfig::from([(
            "vpc".to_string(),
            ConfigValue::reference(ResourceAddress::new("network", "vpc"), "vpc_id"),
        )]);
        db.add_resource(resource("db", "mysql", ResourceKind::Database, config, &[]))
            .unwrap();
        db.add_resource(resource("db", "secret", ResourceKind::Secret, ResourceConfig::new(), &[]))
            .unwrap();

        let mut deployment = Deployment::new("mlflow");
        deployment.add_stack(db).unwrap();
        deployment.add_stack(network).unwrap();
        deployment
    }

    #[test]
    fn test_cross_stack_reference_requires_stack_dependency() {
        let err = DependencyGraph::build(&two_stacks(false)).unwrap_err();
        assert!(matches!(err, ConfigError::UndeclaredDependency { .. }));
    }

    #[test]
    fn test_stack_dependency_orders_all_resources() {
        let graph = DependencyGraph::build(&two_stacks(true)).unwrap();
        let order: Vec<String> = graph
            .topological_order()
            .iter()
            .map(|a| a.to_string())
            .collect();
        // secret は参照を持たないが、スタック依存により network.vpc の後になる
        assert_eq!(order, vec!["network.vpc", "db.mysql", "db.secret"]);
        assert_eq!(
            graph.downstream_stacks("network"),
            BTreeSet::from(["db".to_string()])
        );
    }

    #[test]
    fn test_stack_cycle() {
        let mut deployment = Deployment::new("d");
        deployment
            .add_stack(StackDescriptor::new("a").with_dependency("b"))
            .unwrap();
        deployment
            .add_stack(StackDescriptor::new("b").with_dependency("a"))
            .unwrap();
        match DependencyGraph::build(&deployment).unwrap_err() {
            ConfigError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("Expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_stack_dependency() {
        let mut deployment = Deployment::new("d");
        deployment
            .add_stack(StackDescriptor::new("a").with_dependency("missing"))
            .unwrap();
        assert!(matches!(
            DependencyGraph::build(&deployment),
            Err(ConfigError::UnknownStack(_))
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DependencyGraph::from_stack(&scenario_stack()).unwrap();
        let dependents = graph.transitive_dependents(&ResourceAddress::new("mlflow", "store"));
        let names: Vec<_> = dependents.iter().map(|a| a.resource.as_str()).collect();
        assert_eq!(names, vec!["db", "svc"]);
    }

    #[test]
    fn test_generic_toposort_ignores_missing_nodes() {
        let deps = BTreeMap::from([
            ("b".to_string(), BTreeSet::from(["a".to_string(), "gone".to_string()])),
            ("a".to_string(), BTreeSet::new()),
        ]);
        assert_eq!(toposort(&deps).unwrap(), vec!["a", "b"]);
    }
}
