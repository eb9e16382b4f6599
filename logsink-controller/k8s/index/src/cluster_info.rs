/// Holds cluster metadata.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The namespace where the controller is deployed. Credentials referenced by cluster-scoped
    /// sinks are resolved in this namespace.
    pub controller_ns: String,
}
