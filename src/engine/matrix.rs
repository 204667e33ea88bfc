//! Expansion of (brands, questions, models) into an ordered task sequence.
//!
//! Order is brand-major, question-middle, model-minor. The competitor set for
//! a brand is every other brand in the list, computed once per brand.

use std::collections::HashSet;
use std::sync::Arc;

use super::error::EngineError;
use super::types::Task;

/// Validated inputs for an execution's task matrix.
#[derive(Debug, Clone)]
pub struct TaskMatrix {
    brands: Vec<String>,
    questions: Vec<String>,
    models: Vec<String>,
}

impl TaskMatrix {
    /// Fails with `InvalidInput` if any list is empty or a model name repeats.
    pub fn build(
        brands: Vec<String>,
        questions: Vec<String>,
        models: Vec<String>,
    ) -> Result<Self, EngineError> {
        if brands.is_empty() {
            return Err(EngineError::invalid_input("brands must not be empty"));
        }
        if questions.is_empty() {
            return Err(EngineError::invalid_input("questions must not be empty"));
        }
        if models.is_empty() {
            return Err(EngineError::invalid_input("models must not be empty"));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for model in &models {
            if !seen.insert(model.as_str()) {
                return Err(EngineError::invalid_input(format!(
                    "duplicate model: {model}"
                )));
            }
        }

        Ok(Self {
            brands,
            questions,
            models,
        })
    }

    pub fn total(&self) -> usize {
        self.brands.len() * self.questions.len() * self.models.len()
    }

    pub fn brands(&self) -> &[String] {
        &self.brands
    }

    pub fn questions(&self) -> &[String] {
        &self.questions
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Every brand except `brand`, in list order.
    pub fn competitors_of(&self, brand: &str) -> Vec<String> {
        self.brands
            .iter()
            .filter(|b| b.as_str() != brand)
            .cloned()
            .collect()
    }

    /// Lazily enumerate the tasks in matrix order.
    pub fn tasks(&self) -> impl Iterator<Item = Task> + '_ {
        self.brands.iter().flat_map(move |brand| {
            let competitors: Arc<[String]> = Arc::from(self.competitors_of(brand));
            self.questions.iter().flat_map(move |question| {
                let competitors = competitors.clone();
                self.models.iter().map(move |model| {
                    Task::new(brand.clone(), question.clone(), model.clone())
                        .with_competitors(competitors.clone())
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn total_is_the_product_of_the_three_lists() {
        for (b, q, m) in [(1, 1, 1), (2, 3, 4), (5, 1, 2)] {
            let brands = (0..b).map(|i| format!("b{i}")).collect();
            let questions = (0..q).map(|i| format!("q{i}")).collect();
            let models = (0..m).map(|i| format!("m{i}")).collect();
            let matrix = TaskMatrix::build(brands, questions, models).unwrap();
            assert_eq!(matrix.total(), b * q * m);
            assert_eq!(matrix.tasks().count(), b * q * m);
        }
    }

    #[test]
    fn enumeration_is_brand_major_model_minor() {
        let matrix = TaskMatrix::build(
            strings(&["acme", "globex"]),
            strings(&["q1", "q2"]),
            strings(&["m1", "m2"]),
        )
        .unwrap();

        let order: Vec<(String, String, String)> = matrix
            .tasks()
            .map(|t| (t.brand, t.question, t.model))
            .collect();
        let expected = [
            ("acme", "q1", "m1"),
            ("acme", "q1", "m2"),
            ("acme", "q2", "m1"),
            ("acme", "q2", "m2"),
            ("globex", "q1", "m1"),
            ("globex", "q1", "m2"),
            ("globex", "q2", "m1"),
            ("globex", "q2", "m2"),
        ];
        assert_eq!(order.len(), expected.len());
        for (got, want) in order.iter().zip(expected.iter()) {
            assert_eq!((got.0.as_str(), got.1.as_str(), got.2.as_str()), *want);
        }
    }

    #[test]
    fn competitors_are_recomputed_per_brand() {
        let matrix = TaskMatrix::build(
            strings(&["acme", "globex", "initech"]),
            strings(&["q"]),
            strings(&["m"]),
        )
        .unwrap();
        let tasks: Vec<Task> = matrix.tasks().collect();
        assert_eq!(&*tasks[0].competitors, &strings(&["globex", "initech"])[..]);
        assert_eq!(&*tasks[1].competitors, &strings(&["acme", "initech"])[..]);
        assert_eq!(&*tasks[2].competitors, &strings(&["acme", "globex"])[..]);
    }

    #[test]
    fn rejects_empty_lists_and_duplicate_models() {
        assert!(TaskMatrix::build(vec![], strings(&["q"]), strings(&["m"])).is_err());
        assert!(TaskMatrix::build(strings(&["b"]), vec![], strings(&["m"])).is_err());
        assert!(TaskMatrix::build(strings(&["b"]), strings(&["q"]), vec![]).is_err());

        let err = TaskMatrix::build(strings(&["b"]), strings(&["q"]), strings(&["m", "m"]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(ref msg) if msg.contains("duplicate")));
    }
}
