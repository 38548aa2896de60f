use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use serde::{Deserialize, Serialize};
use crate::composition::{CompositionError, RelationshipInstance, RelationshipKind, ServiceInstance};
use crate::condition::Condition;

/// A composed application: service instances plus the ordered list of edges
/// between them.
///
/// Execution follows the stored edge order, not graph order. Every edge's
/// endpoints are members of the app; removing an instance removes its edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "AppRecord", try_from = "AppRecord")]
pub struct IoTApp {
    id: String,
    name: String,
    service_instances: Vec<ServiceInstance>,
    relationship_instances: Vec<RelationshipInstance>,
}

impl IoTApp {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), name)
    }

    /// Re-create an app under an existing id, so saving it again updates the
    /// stored copy instead of adding another.
    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            service_instances: Vec::new(),
            relationship_instances: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn service_instances(&self) -> &[ServiceInstance] {
        &self.service_instances
    }

    pub fn relationship_instances(&self) -> &[RelationshipInstance] {
        &self.relationship_instances
    }

    pub fn service_instance(&self, id: &str) -> Option<&ServiceInstance> {
        self.service_instances.iter().find(|si| si.id == id)
    }

    pub fn service_instance_mut(&mut self, id: &str) -> Option<&mut ServiceInstance> {
        self.service_instances.iter_mut().find(|si| si.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.service_instance(id).is_some()
    }

    pub fn add_service_instance(&mut self, instance: ServiceInstance) -> Result<(), CompositionError> {
        if self.contains(&instance.id) {
            return Err(CompositionError::DuplicateId(instance.id));
        }
        self.service_instances.push(instance);
        Ok(())
    }

    /// Remove an instance together with every edge touching it.
    pub fn remove_service_instance(&mut self, id: &str) -> Option<ServiceInstance> {
        let pos = self.service_instances.iter().position(|si| si.id == id)?;
        self.relationship_instances.retain(|rel| !rel.touches(id));
        Some(self.service_instances.remove(pos))
    }

    /// Append an edge; both endpoints must already be in the app.
    pub fn add_relationship_instance(&mut self, rel: RelationshipInstance) -> Result<(), CompositionError> {
        for endpoint in [&rel.src, &rel.dst] {
            if !self.contains(endpoint) {
                return Err(CompositionError::InvalidGraph {
                    relationship: rel.id.clone(),
                    instance: endpoint.clone(),
                });
            }
        }
        if self.relationship_instances.iter().any(|r| r.id == rel.id) {
            return Err(CompositionError::DuplicateId(rel.id));
        }
        self.relationship_instances.push(rel);
        Ok(())
    }

    pub fn remove_relationship_instance(&mut self, id: &str) -> Option<RelationshipInstance> {
        let pos = self.relationship_instances.iter().position(|r| r.id == id)?;
        Some(self.relationship_instances.remove(pos))
    }

    /// Human-readable label of an edge, e.g. `ReadTemp → Fan (> 25)`
    pub fn edge_label(&self, rel: &RelationshipInstance) -> String {
        let name_of = |id: &str| {
            self.service_instance(id)
                .map(|si| si.display_name().to_string())
                .unwrap_or_else(|| id.to_string())
        };
        let detail = rel.condition.as_deref().unwrap_or(rel.kind.as_str());
        format!("{} → {} ({})", name_of(&rel.src), name_of(&rel.dst), detail)
    }

    /// Structural problems, as messages for the user. Empty means runnable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.service_instances.is_empty() {
            problems.push("App must have at least one service instance".to_string());
        }

        for si in &self.service_instances {
            let missing = si.missing_inputs();
            if !missing.is_empty() {
                problems.push(format!(
                    "Service '{}' missing inputs: {}",
                    si.display_name(),
                    missing.join(", ")
                ));
            }
        }

        for rel in &self.relationship_instances {
            if !self.contains(&rel.src) {
                problems.push(format!("Relationship '{}' has invalid source service", self.edge_label(rel)));
            }
            if !self.contains(&rel.dst) {
                problems.push(format!("Relationship '{}' has invalid destination service", self.edge_label(rel)));
            }
            match (&rel.kind, rel.condition.as_deref()) {
                (RelationshipKind::Condition, Some(cond)) if cond.parse::<Condition>().is_err() => {
                    problems.push(format!("Relationship '{}' has malformed condition '{}'", self.edge_label(rel), cond));
                }
                (RelationshipKind::Condition, None) => {
                    problems.push(format!("Relationship '{}' has no condition", self.edge_label(rel)));
                }
                (RelationshipKind::Other(tag), _) => {
                    problems.push(format!("Relationship '{}' has unknown type '{}'", self.edge_label(rel), tag));
                }
                _ => {}
            }
        }

        problems
    }

    /// Kahn's algorithm over the current nodes and edges.
    ///
    /// Zero in-degree nodes are taken FIFO starting from insertion order. Nodes
    /// left over when the queue drains sit on a cycle; they are appended in
    /// insertion order so the result always holds every node exactly once. For
    /// those nodes the order carries no meaning.
    pub fn topological_order(&self) -> Vec<&ServiceInstance> {
        let mut in_degree: HashMap<&str, usize> =
            self.service_instances.iter().map(|si| (si.id.as_str(), 0)).collect();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

        for rel in &self.relationship_instances {
            if !in_degree.contains_key(rel.src.as_str()) {
                continue;
            }
            if let Some(d) = in_degree.get_mut(rel.dst.as_str()) {
                *d += 1;
                successors.entry(rel.src.as_str()).or_default().push(rel.dst.as_str());
            }
        }

        let mut queue: VecDeque<&str> = self
            .service_instances
            .iter()
            .map(|si| si.id.as_str())
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut ordered: Vec<&str> = Vec::with_capacity(self.service_instances.len());
        while let Some(id) = queue.pop_front() {
            ordered.push(id);
            for &next in successors.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if ordered.len() < self.service_instances.len() {
            for si in &self.service_instances {
                if !ordered.contains(&si.id.as_str()) {
                    ordered.push(&si.id);
                }
            }
        }

        ordered
            .into_iter()
            .filter_map(|id| self.service_instance(id))
            .collect()
    }

    /// Instances grouped by underlying service, only groups with more than one
    pub fn duplicate_services(&self) -> BTreeMap<String, Vec<&ServiceInstance>> {
        let mut groups: BTreeMap<String, Vec<&ServiceInstance>> = BTreeMap::new();
        for si in &self.service_instances {
            let key = format!("{}_{}", si.service.name, si.service.entity_id);
            groups.entry(key).or_default().push(si);
        }
        groups.retain(|_, v| v.len() > 1);
        groups
    }

    pub fn to_json(&self) -> Result<String, CompositionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CompositionError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for IoTApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IoT Application '{}'", self.name)?;
        writeln!(f, "  Service instances: {}", self.service_instances.len())?;
        writeln!(f, "  Relationships: {}", self.relationship_instances.len())?;

        for si in &self.service_instances {
            let status = if si.is_fully_configured() { "ok" } else { "incomplete" };
            writeln!(f, "  [{}] {}", status, si.display_name())?;
            for (param, value) in &si.input_values {
                writeln!(f, "      {}: {}", param, value)?;
            }
        }

        for rel in &self.relationship_instances {
            writeln!(f, "  {}", self.edge_label(rel))?;
        }

        for (service, instances) in self.duplicate_services() {
            writeln!(f, "  {} used {} times", service, instances.len())?;
        }

        Ok(())
    }
}

/// Durable document form: edges embed their endpoint instances.
#[derive(Serialize, Deserialize)]
struct AppRecord {
    id: String,
    name: String,
    #[serde(default)]
    service_instances: Vec<ServiceInstance>,
    #[serde(default)]
    relationship_instances: Vec<RelationshipRecord>,
}

#[derive(Serialize, Deserialize)]
struct RelationshipRecord {
    id: String,
    src: ServiceInstance,
    dst: ServiceInstance,
    #[serde(rename = "type")]
    kind: RelationshipKind,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl From<IoTApp> for AppRecord {
    fn from(app: IoTApp) -> Self {
        let relationship_instances = app
            .relationship_instances
            .iter()
            .filter_map(|rel| {
                let src = app.service_instance(&rel.src)?.clone();
                let dst = app.service_instance(&rel.dst)?.clone();
                Some(RelationshipRecord {
                    id: rel.id.clone(),
                    src,
                    dst,
                    kind: rel.kind.clone(),
                    condition: rel.condition.clone(),
                    name: rel.name.clone(),
                    category: Some(rel.category.clone()),
                    description: rel.description.clone(),
                })
            })
            .collect();

        AppRecord {
            id: app.id,
            name: app.name,
            service_instances: app.service_instances,
            relationship_instances,
        }
    }
}

impl TryFrom<AppRecord> for IoTApp {
    type Error = CompositionError;

    fn try_from(record: AppRecord) -> Result<Self, Self::Error> {
        let mut app = IoTApp::with_id(record.id, record.name);
        for si in record.service_instances {
            app.add_service_instance(si)?;
        }
        for rel in record.relationship_instances {
            let category = rel
                .category
                .unwrap_or_else(|| rel.kind.default_category().to_string());
            app.add_relationship_instance(RelationshipInstance {
                id: rel.id,
                src: rel.src.id,
                dst: rel.dst.id,
                kind: rel.kind,
                condition: rel.condition,
                name: rel.name,
                category,
                description: rel.description,
            })?;
        }
        Ok(app)
    }
}
