//! Relabeling-invariant ordered partition of a system's variables.
//!
//! Colour refinement assigns each variable a colour computed only from the
//! structure of the system (label, where it occurs, what it multiplies), so
//! relabeling the input relabels the partition and nothing else. Variables
//! left in the same cell are then split into twin classes: variables whose
//! exchange maps the system onto itself. Orderings that differ only inside a
//! twin class produce identical relabeled systems and are enumerated once.

use std::collections::{BTreeSet, HashMap};

use crate::types::{Signature, System, Term, Variable};

/// Equation profile under the current colouring.
type Profile = (Signature, Vec<Vec<usize>>);

/// One cell of the ordered partition.
#[derive(Debug, Clone)]
struct Cell {
    label: String,
    /// Twin classes; members of a class are interchangeable.
    classes: Vec<Vec<Variable>>,
}

impl Cell {
    fn len(&self) -> usize {
        self.classes.iter().map(Vec::len).sum()
    }
}

/// Variables grouped into colour-ordered cells of twin classes.
#[derive(Debug, Clone)]
pub struct OrderedPartition {
    cells: Vec<Cell>,
}

impl OrderedPartition {
    /// Refine the variables of `system` into an ordered partition.
    pub fn compute(system: &System) -> Self {
        let (vars, colors) = refine_colors(system);
        let base = system.sorted();

        let mut by_color: Vec<(usize, Variable)> = colors.into_iter().zip(vars).collect();
        by_color.sort();

        let mut cells: Vec<Cell> = Vec::new();
        let mut last_color = None;
        for (color, var) in by_color {
            if last_color != Some(color) {
                cells.push(Cell {
                    label: var.label().to_string(),
                    classes: Vec::new(),
                });
                last_color = Some(color);
            }
            if let Some(cell) = cells.last_mut() {
                place_in_twin_class(&base, cell, var);
            }
        }

        Self { cells }
    }

    /// Whether every cell holds a single variable.
    pub fn is_discrete(&self) -> bool {
        self.cells.iter().all(|c| c.len() == 1)
    }

    /// Number of distinct relabelings, saturating at `u128::MAX`.
    pub fn candidate_count(&self) -> u128 {
        self.cells.iter().fold(1u128, |acc, cell| {
            let sizes: Vec<usize> = cell.classes.iter().map(Vec::len).collect();
            acc.saturating_mul(multinomial(&sizes))
        })
    }

    /// Visit every relabeling consistent with the partition.
    ///
    /// Each relabeling maps a variable to the same label with index equal to
    /// its position among that label's variables in cell order.
    pub fn for_each_relabeling<F, E>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&HashMap<Variable, Variable>) -> Result<(), E>,
    {
        let per_cell: Vec<Vec<Vec<usize>>> = self
            .cells
            .iter()
            .map(|cell| {
                let sizes: Vec<usize> = cell.classes.iter().map(Vec::len).collect();
                arrangements(&sizes)
            })
            .collect();

        let mut choice = vec![0usize; per_cell.len()];
        loop {
            let mapping = self.build_mapping(&per_cell, &choice);
            visit(&mapping)?;

            // Odometer over per-cell arrangements, last cell fastest.
            let mut pos = choice.len();
            loop {
                if pos == 0 {
                    return Ok(());
                }
                pos -= 1;
                choice[pos] += 1;
                if choice[pos] < per_cell[pos].len() {
                    break;
                }
                choice[pos] = 0;
            }
        }
    }

    fn build_mapping(
        &self,
        per_cell: &[Vec<Vec<usize>>],
        choice: &[usize],
    ) -> HashMap<Variable, Variable> {
        let mut mapping = HashMap::new();
        let mut next_index: HashMap<&str, u32> = HashMap::new();

        for (cell, (arrangements, &pick)) in self.cells.iter().zip(per_cell.iter().zip(choice)) {
            let mut cursor = vec![0usize; cell.classes.len()];
            let counter = next_index.entry(cell.label.as_str()).or_insert(0);
            for &class in &arrangements[pick] {
                let var = &cell.classes[class][cursor[class]];
                cursor[class] += 1;
                *counter += 1;
                mapping.insert(var.clone(), var.with_index(*counter));
            }
        }

        mapping
    }
}

/// Iterated colour refinement. Returns distinct variables and their colours.
///
/// Colour ranks are ordered so that the label is the most significant
/// component; every round keeps the previous colour as the leading key, so
/// cells only ever split.
fn refine_colors(system: &System) -> (Vec<Variable>, Vec<usize>) {
    let vars: Vec<Variable> = system.variables().into_iter().cloned().collect();
    let position: HashMap<&Variable, usize> =
        vars.iter().enumerate().map(|(i, v)| (v, i)).collect();

    let labels: BTreeSet<&str> = vars.iter().map(Variable::label).collect();
    let label_rank: HashMap<&str, usize> =
        labels.into_iter().enumerate().map(|(i, l)| (l, i)).collect();

    let mut colors: Vec<usize> = vars.iter().map(|v| label_rank[v.label()]).collect();
    let mut distinct = count_distinct(&colors);

    loop {
        let describe = |term: &Term| -> Vec<usize> {
            let mut d: Vec<usize> = term.variables().map(|v| colors[position[v]]).collect();
            d.sort();
            d
        };

        let profiles: Vec<Profile> = system
            .equations()
            .iter()
            .map(|eq| {
                let mut descs: Vec<Vec<usize>> = eq.terms().iter().map(describe).collect();
                descs.sort();
                (eq.signature(), descs)
            })
            .collect();

        let mut occurrences: Vec<Vec<(&Profile, Vec<usize>)>> = vec![Vec::new(); vars.len()];
        for (eq, profile) in system.equations().iter().zip(&profiles) {
            for term in eq.terms() {
                let desc = describe(term);
                for var in term.variables() {
                    occurrences[position[var]].push((profile, desc.clone()));
                }
            }
        }
        for occ in &mut occurrences {
            occ.sort();
        }

        let keys: Vec<(usize, &Vec<(&Profile, Vec<usize>)>)> =
            colors.iter().copied().zip(occurrences.iter()).collect();
        let refined = dense_rank(&keys);
        let refined_distinct = count_distinct(&refined);

        colors = refined;
        if refined_distinct == distinct {
            break;
        }
        distinct = refined_distinct;
    }

    (vars, colors)
}

/// Put `var` into the first twin class whose representative it can be
/// exchanged with, or open a new class.
fn place_in_twin_class(base: &System, cell: &mut Cell, var: Variable) {
    for class in &mut cell.classes {
        if is_twin(base, &class[0], &var) {
            class.push(var);
            return;
        }
    }
    cell.classes.push(vec![var]);
}

fn is_twin(base: &System, a: &Variable, b: &Variable) -> bool {
    let swapped = base.map_variables(|v| {
        if v == a {
            b.clone()
        } else if v == b {
            a.clone()
        } else {
            v.clone()
        }
    });
    swapped.sorted() == *base
}

fn dense_rank<T: Ord>(keys: &[T]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| keys[a].cmp(&keys[b]));

    let mut ranks = vec![0usize; keys.len()];
    let mut rank = 0;
    for (i, &idx) in order.iter().enumerate() {
        if i > 0 && keys[order[i - 1]] != keys[idx] {
            rank += 1;
        }
        ranks[idx] = rank;
    }
    ranks
}

fn count_distinct(colors: &[usize]) -> usize {
    colors.iter().collect::<BTreeSet<_>>().len()
}

/// Number of distinct sequences with the given class multiplicities.
fn multinomial(sizes: &[usize]) -> u128 {
    let mut result: u128 = 1;
    let mut placed: u128 = 0;
    for &size in sizes {
        for k in 1..=size as u128 {
            placed += 1;
            // result * placed / k stays integral at every step.
            result = result.saturating_mul(placed) / k;
        }
    }
    result
}

/// All distinct sequences of class ids with the given multiplicities, in
/// lexicographic order.
fn arrangements(sizes: &[usize]) -> Vec<Vec<usize>> {
    fn extend(remaining: &mut [usize], current: &mut Vec<usize>, total: usize, out: &mut Vec<Vec<usize>>) {
        if current.len() == total {
            out.push(current.clone());
            return;
        }
        for class in 0..remaining.len() {
            if remaining[class] == 0 {
                continue;
            }
            remaining[class] -= 1;
            current.push(class);
            extend(remaining, current, total, out);
            current.pop();
            remaining[class] += 1;
        }
    }

    let total = sizes.iter().sum();
    let mut remaining = sizes.to_vec();
    let mut out = Vec::new();
    extend(&mut remaining, &mut Vec::with_capacity(total), total, &mut out);
    out
}
