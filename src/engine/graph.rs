use std::fmt::Write;

use crate::engine::{Registry, TaskId};

/// How a parallel group reacts to a failing member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Join {
    /// Every member runs to completion, the first failure is reported.
    #[default]
    Settle,
    /// The first failure cancels the members which are still running.
    FailFast,
}

/// A composition of registered tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Graph {
    Leaf(TaskId),
    Sequence(Vec<Graph>),
    Parallel(Vec<Graph>, Join),
}

impl Graph {
    pub fn leaf(id: TaskId) -> Self {
        Graph::Leaf(id)
    }

    pub fn sequence<I>(nodes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Graph>,
    {
        Graph::Sequence(nodes.into_iter().map(Into::into).collect())
    }

    pub fn parallel<I>(nodes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Graph>,
    {
        Graph::Parallel(nodes.into_iter().map(Into::into).collect(), Join::Settle)
    }

    pub fn parallel_fail_fast<I>(nodes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Graph>,
    {
        Graph::Parallel(nodes.into_iter().map(Into::into).collect(), Join::FailFast)
    }

    /// Every task referenced by this graph, in declaration order.
    pub fn leaves(&self) -> Vec<TaskId> {
        let mut acc = Vec::new();
        self.collect_leaves(&mut acc);
        acc
    }

    fn collect_leaves(&self, acc: &mut Vec<TaskId>) {
        match self {
            Graph::Leaf(id) => acc.push(*id),
            Graph::Sequence(nodes) | Graph::Parallel(nodes, _) => {
                for node in nodes {
                    node.collect_leaves(acc);
                }
            }
        }
    }

    /// Renders the graph as a compact expression, e.g.
    /// `series(clean:build, parallel(html:build, css:build))`.
    pub fn describe(&self, registry: &Registry) -> String {
        let mut f = String::new();
        self.write_to(&mut f, registry);
        f
    }

    fn write_to(&self, f: &mut String, registry: &Registry) {
        let (label, nodes) = match self {
            Graph::Leaf(id) => {
                f.push_str(registry.name(*id));
                return;
            }
            Graph::Sequence(nodes) => ("series", nodes),
            Graph::Parallel(nodes, Join::Settle) => ("parallel", nodes),
            Graph::Parallel(nodes, Join::FailFast) => ("parallel!", nodes),
        };

        let _ = write!(f, "{label}(");
        for (i, node) in nodes.iter().enumerate() {
            if i > 0 {
                f.push_str(", ");
            }
            node.write_to(f, registry);
        }
        f.push(')');
    }
}

impl From<TaskId> for Graph {
    fn from(id: TaskId) -> Self {
        Graph::Leaf(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_nested() {
        let mut registry = Registry::new();
        let clean = registry.register("clean", |_| Ok(())).unwrap();
        let html = registry.register("html", |_| Ok(())).unwrap();
        let css = registry.register("css", |_| Ok(())).unwrap();

        let graph = Graph::sequence([
            Graph::leaf(clean),
            Graph::parallel([html, css]),
            Graph::parallel_fail_fast([css]),
        ]);

        assert_eq!(
            graph.describe(&registry),
            "series(clean, parallel(html, css), parallel!(css))"
        );
        assert_eq!(graph.leaves(), vec![clean, html, css, css]);
    }
}
