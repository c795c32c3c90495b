//! Ordered parameter collection
//!
//! [`Parameters`] keeps the declaration order of the problem's parameters,
//! which fixes the order of optimization vectors and of parameter files.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::parameters::parameter::{Parameter, ParameterError};

/// A collection of parameters in declaration order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Parameter>", into = "Vec<Parameter>")]
pub struct Parameters {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl From<Vec<Parameter>> for Parameters {
    fn from(params: Vec<Parameter>) -> Self {
        let index = params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        Self { params, index }
    }
}

impl From<Parameters> for Vec<Parameter> {
    fn from(params: Parameters) -> Self {
        params.params
    }
}

impl Parameters {
    /// Create a new empty parameters collection
    ///
    /// ```
    /// use reflfit::parameters::Parameters;
    ///
    /// let params = Parameters::new();
    /// assert!(params.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter to the end of the collection.
    ///
    /// Names must be unique.
    pub fn add(&mut self, param: Parameter) -> Result<(), ParameterError> {
        if self.index.contains_key(&param.name) {
            return Err(ParameterError::DuplicateName { name: param.name });
        }
        self.index.insert(param.name.clone(), self.params.len());
        self.params.push(param);
        Ok(())
    }

    /// Add a free, unbounded parameter
    pub fn add_param(&mut self, name: &str, value: f64) -> Result<(), ParameterError> {
        self.add(Parameter::new(name, value))
    }

    /// Add a free parameter constrained to `[lo, hi]`
    ///
    /// ```
    /// use reflfit::parameters::Parameters;
    ///
    /// let mut params = Parameters::new();
    /// params.add_param_with_bounds("thickness", 50.0, 0.0, 200.0).unwrap();
    /// params.add_fixed("substrate", 2.07).unwrap();
    /// assert_eq!(params.fitted().len(), 1);
    /// ```
    pub fn add_param_with_bounds(
        &mut self,
        name: &str,
        value: f64,
        lo: f64,
        hi: f64,
    ) -> Result<(), ParameterError> {
        self.add(Parameter::with_range(name, value, lo, hi)?)
    }

    /// Add a fixed parameter
    pub fn add_fixed(&mut self, name: &str, value: f64) -> Result<(), ParameterError> {
        self.add(Parameter::fixed(name, value))
    }

    /// Get a parameter by name
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    /// Get a mutable parameter by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.params[i]),
            None => None,
        }
    }

    /// Position of a parameter in declaration order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterate in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }

    /// Current values of every parameter, fixed ones included
    pub fn values(&self) -> Array1<f64> {
        self.params.iter().map(|p| p.value()).collect()
    }

    /// Parameters varied by the optimizer
    pub fn fitted(&self) -> Vec<&Parameter> {
        self.params.iter().filter(|p| p.is_fitted()).collect()
    }

    /// Parameters held at their current value
    pub fn fixed(&self) -> Vec<&Parameter> {
        self.params.iter().filter(|p| !p.is_fitted()).collect()
    }

    /// Overwrite every parameter value from a full-length vector.
    pub fn set_values(&mut self, values: &Array1<f64>) -> Result<(), ParameterError> {
        if values.len() != self.params.len() {
            return Err(ParameterError::LengthMismatch {
                expected: self.params.len(),
                actual: values.len(),
            });
        }
        for (param, &value) in self.params.iter_mut().zip(values.iter()) {
            param.set_value(value)?;
        }
        Ok(())
    }

    /// Overwrite the fitted parameters from an optimization vector.
    pub fn set_fitted_values(&mut self, values: &Array1<f64>) -> Result<(), ParameterError> {
        let fitted: Vec<usize> = (0..self.params.len())
            .filter(|&i| self.params[i].is_fitted())
            .collect();
        if fitted.len() != values.len() {
            return Err(ParameterError::LengthMismatch {
                expected: fitted.len(),
                actual: values.len(),
            });
        }
        for (&i, &value) in fitted.iter().zip(values.iter()) {
            self.params[i].set_value(value)?;
        }
        Ok(())
    }

    /// Render the `.par` format: one `name value` line per parameter.
    pub fn to_par_string(&self) -> String {
        self.params
            .iter()
            .map(|p| format!("{} {}\n", p.name, p.value()))
            .collect()
    }

    /// Restore values from `.par` text.
    ///
    /// Lines are matched to parameters by position and the last token of
    /// each line is taken as the value; extra parameters keep their values.
    pub fn apply_par_str(&mut self, text: &str) -> Result<usize, ParameterError> {
        let mut applied = 0;
        let lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        for (param, (line_no, line)) in self.params.iter_mut().zip(lines) {
            let token = line.split_whitespace().last().unwrap_or_default();
            let value: f64 = token.parse().map_err(|_| ParameterError::ParFile {
                line: line_no + 1,
                message: format!("cannot parse '{}' as a number", token),
            })?;
            param.set_value(value)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Write the `.par` file
    pub fn save_par<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        fs::write(path, self.to_par_string())
    }

    /// Restore values from a `.par` file
    pub fn load_par<P: AsRef<Path>>(&mut self, path: P) -> crate::error::Result<usize> {
        let text = fs::read_to_string(path)?;
        Ok(self.apply_par_str(&text)?)
    }

    /// Serialize the parameters to a JSON string
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize parameters from a JSON string, validating bounds and names.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        let list: Vec<Parameter> = serde_json::from_str(json)?;
        let mut params = Parameters::new();
        for param in list {
            param.bounds().validate().map_err(ParameterError::from)?;
            params.add(param)?;
        }
        Ok(params)
    }
}
