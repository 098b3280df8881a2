//! Near-duplicate detection inside each cluster.
//!
//! Two responses are linked when the cosine similarity of their full
//! embeddings reaches the threshold; groups are the connected components of
//! that graph, so A~B and B~C put A, B and C together even if A and C are not
//! directly similar. Responses in different clusters are never compared.
use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;

use crate::pipeline::vector_math::{cosine_similarity, mean_vector};

/// One embedded response with the cluster it was assigned to, if any.
#[derive(Debug, Clone, Copy)]
pub struct ClusteredVector<'a> {
    pub id: &'a str,
    pub cluster_index: Option<u32>,
    pub embedding: &'a [f32],
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupCandidate {
    pub cluster_index: u32,
    pub representative_id: String,
    /// Members in input order; includes the representative.
    pub member_ids: Vec<String>,
}

impl GroupCandidate {
    pub fn size(&self) -> usize {
        self.member_ids.len()
    }
}

/// Connected components of the similarity graph, per cluster, keeping only
/// those with at least `min_group_size` members. Output is ordered by cluster
/// index, then by the input position of each group's first member.
pub fn find_similarity_groups(items: &[ClusteredVector<'_>], threshold: f32, min_group_size: usize) -> Vec<GroupCandidate> {
    let mut by_cluster: BTreeMap<u32, Vec<ClusteredVector<'_>>> = BTreeMap::new();
    for item in items {
        if let Some(cluster) = item.cluster_index {
            by_cluster.entry(cluster).or_default().push(*item);
        }
    }

    let per_cluster: Vec<Vec<GroupCandidate>> = by_cluster
        .into_par_iter()
        .map(|(cluster, members)| groups_in_cluster(cluster, &members, threshold, min_group_size))
        .collect();
    per_cluster.into_iter().flatten().collect()
}

fn groups_in_cluster(
    cluster: u32,
    members: &[ClusteredVector<'_>],
    threshold: f32,
    min_group_size: usize,
) -> Vec<GroupCandidate> {
    let n = members.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], i: usize) -> usize {
        if parent[i] != i {
            parent[i] = find(parent, parent[i]);
        }
        parent[i]
    }

    fn union(parent: &mut [usize], i: usize, j: usize) {
        let pi = find(parent, i);
        let pj = find(parent, j);
        if pi != pj {
            parent[pi.max(pj)] = pi.min(pj);
        }
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if cosine_similarity(members[i].embedding, members[j].embedding) >= threshold {
                union(&mut parent, i, j);
            }
        }
    }

    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        let slot = *slot_of_root.entry(root).or_insert_with(|| {
            components.push(Vec::new());
            components.len() - 1
        });
        components[slot].push(i);
    }

    components
        .into_iter()
        .filter(|component| !component.is_empty() && component.len() >= min_group_size)
        .map(|component| GroupCandidate {
            cluster_index: cluster,
            representative_id: members[representative(members, &component)].id.to_string(),
            member_ids: component.iter().map(|&i| members[i].id.to_string()).collect(),
        })
        .collect()
}

/// Member closest (by cosine) to the component mean; ties go to the earliest.
fn representative(members: &[ClusteredVector<'_>], component: &[usize]) -> usize {
    let dim = members[component[0]].embedding.len();
    let centroid = mean_vector(component.iter().map(|&i| members[i].embedding), dim);
    let mut best = component[0];
    let mut best_sim = f32::MIN;
    for &i in component {
        let sim = cosine_similarity(members[i].embedding, &centroid);
        if sim > best_sim {
            best_sim = sim;
            best = i;
        }
    }
    best
}
