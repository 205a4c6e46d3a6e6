/*!
The path primitives behind the O(depth) Shapley recurrence.

A path holds one `PathElement` per distinct feature split on between the root and the current node, preceded by a root element with no feature. Each element records the fraction of the "feature absent" mass (`zero_fraction`) and "feature present" mass (`one_fraction`) that flows down the path, and `pweight` holds, for every subset size, the proportion of feature orderings consistent with the path.
*/

use num_traits::ToPrimitive;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PathElement {
	pub feature_index: Option<usize>,
	pub zero_fraction: f32,
	pub one_fraction: f32,
	pub pweight: f32,
}

impl Default for PathElement {
	fn default() -> Self {
		Self {
			feature_index: None,
			zero_fraction: 0.0,
			one_fraction: 0.0,
			pweight: 0.0,
		}
	}
}

/// Append an element at `unique_depth` and update the weights of every element before it.
pub fn extend_path(
	path: &mut [PathElement],
	unique_depth: usize,
	zero_fraction: f32,
	one_fraction: f32,
	feature_index: Option<usize>,
) {
	path[unique_depth] = PathElement {
		feature_index,
		zero_fraction,
		one_fraction,
		pweight: if unique_depth == 0 { 1.0 } else { 0.0 },
	};
	let n = (unique_depth + 1).to_f32().unwrap();
	for i in (0..unique_depth).rev() {
		let pweight = path[i].pweight;
		path[i + 1].pweight += one_fraction * pweight * (i + 1).to_f32().unwrap() / n;
		path[i].pweight = zero_fraction * pweight * (unique_depth - i).to_f32().unwrap() / n;
	}
}

/// Remove the element at `path_index`, undoing its effect on the weights. The caller decrements its depth afterward.
pub fn unwind_path(path: &mut [PathElement], unique_depth: usize, path_index: usize) {
	let PathElement {
		zero_fraction,
		one_fraction,
		..
	} = path[path_index];
	let n = (unique_depth + 1).to_f32().unwrap();
	let mut next_one_portion = path[unique_depth].pweight;
	for i in (0..unique_depth).rev() {
		let below = (unique_depth - i).to_f32().unwrap();
		if one_fraction != 0.0 {
			let pweight = path[i].pweight;
			path[i].pweight = next_one_portion * n / ((i + 1).to_f32().unwrap() * one_fraction);
			next_one_portion = pweight - path[i].pweight * zero_fraction * below / n;
		} else {
			path[i].pweight = path[i].pweight * n / (zero_fraction * below);
		}
	}
	for i in path_index..unique_depth {
		let next = path[i + 1];
		path[i].feature_index = next.feature_index;
		path[i].zero_fraction = next.zero_fraction;
		path[i].one_fraction = next.one_fraction;
	}
}

/// The total weight the path would have without the element at `path_index`, computed without modifying the path.
pub fn unwound_path_sum(path: &[PathElement], unique_depth: usize, path_index: usize) -> f32 {
	let PathElement {
		zero_fraction,
		one_fraction,
		..
	} = path[path_index];
	let mut total = 0.0;
	if one_fraction != 0.0 {
		let mut next_one_portion = path[unique_depth].pweight;
		for i in (0..unique_depth).rev() {
			let portion = next_one_portion / ((i + 1).to_f32().unwrap() * one_fraction);
			total += portion;
			next_one_portion =
				path[i].pweight - portion * zero_fraction * (unique_depth - i).to_f32().unwrap();
		}
	} else {
		for i in (0..unique_depth).rev() {
			total += path[i].pweight / (zero_fraction * (unique_depth - i).to_f32().unwrap());
		}
	}
	total * (unique_depth + 1).to_f32().unwrap()
}

/**
A `PathBuffer` is the scratch space for one explanation at a time. Each level of the recursion copies its parent's path into the region after it, so a tree of depth `d` needs `(d + 2) * (d + 3) / 2` elements. Keep one buffer per thread and reuse it across instances.
*/
#[derive(Clone, Debug, Default)]
pub struct PathBuffer {
	elements: Vec<PathElement>,
}

impl PathBuffer {
	pub fn new(max_depth: usize) -> Self {
		Self {
			elements: vec![PathElement::default(); Self::len_for_depth(max_depth)],
		}
	}

	pub fn len_for_depth(depth: usize) -> usize {
		(depth + 2) * (depth + 3) / 2
	}

	/// A path large enough for a tree of depth `depth`, growing the buffer if necessary.
	pub fn path(&mut self, depth: usize) -> &mut [PathElement] {
		let len = Self::len_for_depth(depth);
		if self.elements.len() < len {
			self.elements.resize(len, PathElement::default());
		}
		&mut self.elements[..len]
	}
}

#[test]
fn test_extend_then_unwind() {
	let mut path = vec![PathElement::default(); 4];
	extend_path(&mut path, 0, 1.0, 1.0, None);
	extend_path(&mut path, 1, 0.75, 1.0, Some(0));
	extend_path(&mut path, 2, 0.25, 0.0, Some(1));
	assert_eq!(path[0].pweight, 0.0625);
	assert!((path[1].pweight - 1.0 / 24.0).abs() < 1e-7);
	assert_eq!(path[2].pweight, 0.0);
	// Removing feature 1 leaves the same weights as never having added it.
	let expected = {
		let mut path = vec![PathElement::default(); 4];
		extend_path(&mut path, 0, 1.0, 1.0, None);
		extend_path(&mut path, 1, 0.75, 1.0, Some(0));
		path
	};
	let sum = unwound_path_sum(&path, 2, 2);
	assert!((sum - (expected[0].pweight + expected[1].pweight)).abs() < 1e-6);
	unwind_path(&mut path, 2, 2);
	for i in 0..2 {
		assert!((path[i].pweight - expected[i].pweight).abs() < 1e-6);
		assert_eq!(path[i].feature_index, expected[i].feature_index);
	}
}

#[test]
fn test_path_buffer() {
	let mut buffer = PathBuffer::new(0);
	assert_eq!(buffer.path(0).len(), 3);
	assert_eq!(buffer.path(3).len(), 15);
	assert_eq!(buffer.path(1).len(), 6);
}
