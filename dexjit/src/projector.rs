//! Projection over record batches: name-based expressions in, a new
//! `RecordBatch` out.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};

use crate::annotator::OutputColumn;
use crate::config::GeneratorConfig;
use crate::dex::Expression;
use crate::error::{BuildError, ExecError};
use crate::generator::Generator;
use crate::registry::FunctionRegistry;
use crate::tree::{decompose, Node};
use crate::types::ScalarType;

/// One output column of a JSON projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ScalarType,
    #[serde(default = "nullable_default")]
    pub nullable: bool,
    pub expr: Node,
}

fn nullable_default() -> bool {
    true
}

/// A built generator plus the schema of the batches it produces.
pub struct Projector {
    generator: Generator,
    output_schema: SchemaRef,
}

impl Projector {
    /// Build a projector over `schema` with the stock primitives.
    pub fn make(
        schema: SchemaRef,
        exprs: Vec<(Node, Field)>,
        config: GeneratorConfig,
    ) -> Result<Self, BuildError> {
        Self::make_with_registry(schema, exprs, FunctionRegistry::with_defaults(), config)
    }

    pub fn make_with_registry(
        schema: SchemaRef,
        exprs: Vec<(Node, Field)>,
        registry: FunctionRegistry,
        config: GeneratorConfig,
    ) -> Result<Self, BuildError> {
        let mut generator = Generator::new(schema, registry, config)?;
        let mut expressions = Vec::with_capacity(exprs.len());
        let mut fields = Vec::with_capacity(exprs.len());
        for (node, field) in exprs {
            let root = decompose(&node, generator.annotator(), generator.registry())?;
            let output = generator.add_output(&field)?;
            expressions.push(Expression::new(root, output));
            fields.push(field);
        }
        generator.build(expressions)?;

        Ok(Self {
            generator,
            output_schema: Arc::new(Schema::new(fields)),
        })
    }

    /// Build from a JSON array of [`ProjectionEntry`].
    pub fn from_json(
        schema: SchemaRef,
        json: &str,
        config: GeneratorConfig,
    ) -> Result<Self, BuildError> {
        let entries: Vec<ProjectionEntry> = serde_json::from_str(json)?;
        let exprs = entries
            .into_iter()
            .map(|e| {
                let field = Field::new(e.name, e.ty.to_arrow(), e.nullable);
                (e.expr, field)
            })
            .collect();
        Self::make(schema, exprs, config)
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Evaluate every expression over `batch`.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<RecordBatch, ExecError> {
        let record_count = batch.num_rows();
        let mut outputs: Vec<OutputColumn> = self
            .generator
            .compiled_exprs()
            .iter()
            .map(|c| OutputColumn::new(c.output().ty, record_count))
            .collect();
        self.generator.execute(batch, &mut outputs)?;

        let columns = outputs
            .into_iter()
            .map(|out| out.into_array(record_count))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RecordBatch::try_new(self.output_schema.clone(), columns)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Float64Array, Int32Array};
    use arrow::datatypes::DataType;

    #[test]
    fn test_from_json() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        let json = r#"[
            { "name": "a_plus_one", "type": "int32", "expr":
                { "node": "call", "name": "add", "args": [
                    { "node": "field", "name": "a" },
                    { "node": "literal", "value": { "type": "int32", "value": 1 } } ] } },
            { "name": "a_f64", "type": "float64", "nullable": true, "expr":
                { "node": "call", "name": "castFLOAT8",
                  "args": [ { "node": "field", "name": "a" } ] } }
        ]"#;
        let projector =
            Projector::from_json(schema.clone(), json, GeneratorConfig::default()).unwrap();

        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(vec![Some(4), None]))],
        )
        .unwrap();
        let out = projector.evaluate(&batch).unwrap();
        assert_eq!(out.num_columns(), 2);

        let plus = out.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(plus.value(0), 5);
        assert!(plus.is_null(1));
        let cast = out.column(1).as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(cast.value(0), 4.0);
        assert!(cast.is_null(1));
    }
}
